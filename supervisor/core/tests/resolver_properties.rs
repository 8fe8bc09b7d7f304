// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use deskbundle_core::domain::resolver::{DependencyGraph, ResolveError};
use deskbundle_core::domain::state::{RuntimeState, ServiceState};
use proptest::prelude::*;
use std::collections::BTreeMap;

/// Acyclic graphs: node `i` may only depend on nodes with a smaller index.
fn acyclic_graph() -> impl Strategy<Value = Vec<(String, Vec<String>)>> {
    (1usize..12)
        .prop_flat_map(|n| proptest::collection::vec(proptest::collection::vec(any::<bool>(), n), n))
        .prop_map(|matrix| {
            let n = matrix.len();
            // Names in reverse so id order never matches dependency order.
            let name = |i: usize| format!("svc-{:02}", n - i);
            (0..n)
                .map(|i| {
                    let deps = (0..i).filter(|j| matrix[i][*j]).map(name).collect();
                    (name(i), deps)
                })
                .collect()
        })
}

fn build(nodes: &[(String, Vec<String>)]) -> Result<DependencyGraph, ResolveError> {
    DependencyGraph::build(nodes.iter().map(|(id, deps)| (id.as_str(), deps.as_slice())))
}

proptest! {
    #[test]
    fn every_service_follows_its_dependencies(nodes in acyclic_graph()) {
        let order = build(&nodes).unwrap().order().unwrap();
        prop_assert_eq!(order.len(), nodes.len());

        let position: BTreeMap<&str, usize> =
            order.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
        for (id, deps) in &nodes {
            for dep in deps {
                prop_assert!(position[dep.as_str()] < position[id.as_str()], "{} before {}", dep, id);
            }
        }
    }

    #[test]
    fn closing_a_chain_is_always_a_cycle(len in 2usize..8) {
        let ids: Vec<String> = (0..len).map(|i| format!("n{}", i)).collect();
        let nodes: Vec<(String, Vec<String>)> = (0..len)
            .map(|i| (ids[i].clone(), vec![ids[(i + 1) % len].clone()]))
            .collect();

        match build(&nodes).unwrap().order() {
            Err(ResolveError::Cycle { ids: cycle }) => prop_assert_eq!(cycle.len(), len),
            other => prop_assert!(false, "expected a cycle, got {:?}", other),
        }
    }

    #[test]
    fn transition_sequences_stay_on_the_lifecycle(steps in proptest::collection::vec(0usize..6, 0..12)) {
        const STATES: [ServiceState; 6] = [
            ServiceState::Pending,
            ServiceState::Starting,
            ServiceState::Ready,
            ServiceState::Stopping,
            ServiceState::Stopped,
            ServiceState::Failed,
        ];
        let mut state = RuntimeState::new("prop");
        state.plan([("svc", "api")]);
        for step in steps {
            let _ = state.transition("svc", STATES[step]);
        }

        let transitions = state.get("svc").unwrap().transitions.clone();
        // Shutdown may catch a service while it is still starting.
        let interrupted = [STATES[0], STATES[1], STATES[3], STATES[4]];
        let on_a_path = |seq: &[ServiceState]| STATES[..5].starts_with(seq) || interrupted.starts_with(seq);

        let (last, prefix) = transitions.split_last().unwrap();
        if *last == ServiceState::Failed {
            prop_assert!(STATES[..3].starts_with(prefix), "failed from {:?}", prefix);
            prop_assert!(!prefix.is_empty());
        } else {
            prop_assert!(on_a_path(&transitions), "off the lifecycle: {:?}", transitions);
        }
    }
}
