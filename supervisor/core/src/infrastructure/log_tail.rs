// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Log Tail
//
// Last lines of a service log, for failure reports. Only the end of the file
// is read, so large logs stay cheap.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// Maximum number of trailing bytes inspected.
const TAIL_WINDOW: u64 = 64 * 1024;

/// Last `max_lines` lines of `path`, oldest first. Missing or unreadable files
/// yield an empty list.
pub fn tail_lines(path: &Path, max_lines: usize) -> Vec<String> {
    if max_lines == 0 {
        return vec![];
    }
    read_tail(path, max_lines).unwrap_or_default()
}

fn read_tail(path: &Path, max_lines: usize) -> std::io::Result<Vec<String>> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(TAIL_WINDOW);
    file.seek(SeekFrom::Start(start))?;

    let mut bytes = Vec::with_capacity((len - start) as usize);
    file.read_to_end(&mut bytes)?;
    let text = String::from_utf8_lossy(&bytes);

    let mut lines: Vec<&str> = text.lines().collect();
    // The first line is probably cut in half when we started mid-file.
    if start > 0 && !lines.is_empty() {
        lines.remove(0);
    }
    let skip = lines.len().saturating_sub(max_lines);
    Ok(lines[skip..].iter().map(|line| line.to_string()).collect())
}
