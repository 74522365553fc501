//! Translation between module runtime status and pod/container status.
//!
//! Pure functions: equal inputs yield equal outputs. The provider calls
//! these on every status arrival to recompute the pod status it pushes
//! upstream.

use chrono::Utc;

use modulet_api::{
    is_biz_image, BizState, BizStatusData, ConditionStatus, Container, ContainerState,
    ContainerStatus, Pod, PodCondition, PodIp, PodPhase, PodStatus, CONDITION_CONTAINERS_READY,
    CONDITION_READY,
};

/// Waiting reason while a module is known but not resolved on the base.
pub const REASON_BIZ_PENDING: &str = "BizPending";

/// Waiting reason while the module is resolved and installing.
pub const REASON_BIZ_RESOLVED: &str = "BizResolved";

/// Builds the status record for one container.
///
/// A matching observation (same module name) wins over whatever was synced
/// before; a non-matching or absent one falls back to the existing status,
/// or to an uninitialized record when the container has never reported.
pub fn container_status_from_biz(
    container: &Container,
    existing: Option<&ContainerStatus>,
    biz: Option<&BizStatusData>,
) -> ContainerStatus {
    let Some(biz) = biz.filter(|b| b.name == container.name) else {
        return existing.cloned().unwrap_or_else(|| ContainerStatus {
            name: container.name.clone(),
            image: container.image.clone(),
            ready: false,
            state: None,
        });
    };

    let (state, ready) = match biz.state {
        BizState::Unresolved => (
            ContainerState::Waiting {
                reason: Some(REASON_BIZ_PENDING.to_string()),
                message: biz.message.clone(),
            },
            false,
        ),
        BizState::Resolved => (
            ContainerState::Waiting {
                reason: Some(REASON_BIZ_RESOLVED.to_string()),
                message: biz.message.clone(),
            },
            false,
        ),
        BizState::Activated => (
            ContainerState::Running {
                started_at: Some(biz.change_time),
            },
            true,
        ),
        BizState::Deactivated => (
            ContainerState::Terminated {
                exit_code: 0,
                reason: biz.reason.clone(),
                message: biz.message.clone(),
                finished_at: Some(biz.change_time),
            },
            false,
        ),
        BizState::Broken => (
            ContainerState::Terminated {
                exit_code: 1,
                reason: biz.reason.clone(),
                message: biz.message.clone(),
                finished_at: Some(biz.change_time),
            },
            false,
        ),
    };

    ContainerStatus {
        name: container.name.clone(),
        image: container.image.clone(),
        ready,
        state: Some(state),
    }
}

/// Recomputes the whole pod status from the module containers.
///
/// Only containers whose image denotes a module artifact take part in the
/// aggregation; anything else in the pod's spec is ignored. The pod IP is the
/// provider's local address since modules share the base's network.
pub fn build_pod_status(local_ip: &str, pod: &Pod, biz: Option<&BizStatusData>) -> PodStatus {
    let mut status = PodStatus {
        pod_ip: Some(local_ip.to_string()),
        pod_ips: vec![PodIp {
            ip: local_ip.to_string(),
        }],
        ..Default::default()
    };

    let mut total = 0usize;
    let mut ready = 0usize;
    let mut terminated = 0usize;
    let mut not_ready = 0usize;
    let mut uninitialized = 0usize;

    for container in &pod.spec.containers {
        if !is_biz_image(&container.image) {
            continue;
        }

        let existing = pod
            .status
            .container_statuses
            .iter()
            .find(|cs| cs.name == container.name);
        let container_status = container_status_from_biz(container, existing, biz);

        total += 1;
        if container_status.ready {
            ready += 1;
        } else {
            match &container_status.state {
                Some(ContainerState::Terminated { .. }) => terminated += 1,
                Some(ContainerState::Waiting { .. }) | Some(ContainerState::Running { .. }) => {
                    not_ready += 1
                }
                None => uninitialized += 1,
            }
        }
        status.container_statuses.push(container_status);
    }

    let (phase, condition) = if total == 0 || total == terminated {
        (PodPhase::Succeeded, ConditionStatus::False)
    } else if uninitialized == total {
        (PodPhase::Pending, ConditionStatus::False)
    } else if ready == total {
        (PodPhase::Running, ConditionStatus::True)
    } else if not_ready > 0 || ready > 0 {
        (PodPhase::Running, ConditionStatus::False)
    } else {
        (PodPhase::Pending, ConditionStatus::False)
    };

    status.phase = phase;
    let now = Utc::now();
    status.conditions = vec![
        PodCondition {
            condition_type: CONDITION_READY.to_string(),
            status: condition,
            last_probe_time: Some(now),
            last_transition_time: None,
        },
        PodCondition {
            condition_type: CONDITION_CONTAINERS_READY.to_string(),
            status: condition,
            last_probe_time: Some(now),
            last_transition_time: None,
        },
    ];
    status
}

#[cfg(test)]
mod tests {
    use super::*;
    use modulet_api::{ObjectMeta, PodSpec};

    fn biz_container(name: &str) -> Container {
        Container {
            name: name.to_string(),
            image: format!("repo/{name}-1.0.jar"),
            env: vec![],
        }
    }

    fn make_pod(containers: Vec<Container>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: "pod1".to_string(),
                namespace: "ns1".to_string(),
                ..Default::default()
            },
            spec: PodSpec { containers },
            status: PodStatus::default(),
        }
    }

    fn observation(name: &str, state: BizState) -> BizStatusData {
        BizStatusData {
            key: format!("{name}:1.0"),
            name: name.to_string(),
            pod_key: "ns1/pod1".to_string(),
            state,
            change_time: Utc::now(),
            reason: Some("reason".to_string()),
            message: Some("message".to_string()),
            revision: 0,
        }
    }

    fn pod_with_states(states: Vec<BizState>) -> Pod {
        // One container per state; each gets its own observation applied.
        let containers: Vec<Container> = states
            .iter()
            .enumerate()
            .map(|(i, _)| biz_container(&format!("biz-{i}")))
            .collect();
        let mut pod = make_pod(containers);
        for (i, state) in states.into_iter().enumerate() {
            let obs = observation(&format!("biz-{i}"), state);
            let status = build_pod_status("127.0.0.1", &pod, Some(&obs));
            pod.status = status;
        }
        pod
    }

    #[test]
    fn activated_maps_to_running_and_ready() {
        let c = biz_container("biz-a");
        let obs = observation("biz-a", BizState::Activated);
        let status = container_status_from_biz(&c, None, Some(&obs));

        assert!(status.ready);
        assert!(matches!(
            status.state,
            Some(ContainerState::Running { started_at: Some(t) }) if t == obs.change_time
        ));
    }

    #[test]
    fn unresolved_and_resolved_map_to_waiting() {
        let c = biz_container("biz-a");

        let pending =
            container_status_from_biz(&c, None, Some(&observation("biz-a", BizState::Unresolved)));
        assert!(matches!(
            pending.state,
            Some(ContainerState::Waiting { ref reason, .. }) if reason.as_deref() == Some(REASON_BIZ_PENDING)
        ));

        let resolving =
            container_status_from_biz(&c, None, Some(&observation("biz-a", BizState::Resolved)));
        assert!(matches!(
            resolving.state,
            Some(ContainerState::Waiting { ref reason, .. }) if reason.as_deref() == Some(REASON_BIZ_RESOLVED)
        ));
    }

    #[test]
    fn deactivated_terminates_cleanly_and_broken_fails() {
        let c = biz_container("biz-a");

        let stopped =
            container_status_from_biz(&c, None, Some(&observation("biz-a", BizState::Deactivated)));
        assert!(matches!(
            stopped.state,
            Some(ContainerState::Terminated { exit_code: 0, .. })
        ));
        assert!(!stopped.ready);

        let broken =
            container_status_from_biz(&c, None, Some(&observation("biz-a", BizState::Broken)));
        match broken.state {
            Some(ContainerState::Terminated {
                exit_code,
                reason,
                message,
                ..
            }) => {
                assert_eq!(exit_code, 1);
                assert_eq!(reason.as_deref(), Some("reason"));
                assert_eq!(message.as_deref(), Some("message"));
            }
            state => panic!("unexpected state: {state:?}"),
        }
        assert!(!broken.ready);
    }

    #[test]
    fn non_matching_observation_keeps_existing_status() {
        let c = biz_container("biz-a");
        let existing = ContainerStatus {
            name: "biz-a".to_string(),
            image: c.image.clone(),
            ready: true,
            state: Some(ContainerState::Running { started_at: None }),
        };

        let obs = observation("biz-other", BizState::Broken);
        let status = container_status_from_biz(&c, Some(&existing), Some(&obs));
        assert_eq!(status, existing);
    }

    #[test]
    fn absent_observation_without_history_is_uninitialized() {
        let c = biz_container("biz-a");
        let status = container_status_from_biz(&c, None, None);
        assert!(status.state.is_none());
        assert!(!status.ready);
    }

    #[test]
    fn no_biz_containers_means_succeeded() {
        let pod = make_pod(vec![Container {
            name: "sidecar".to_string(),
            image: "nginx:1.27".to_string(),
            env: vec![],
        }]);

        let status = build_pod_status("127.0.0.1", &pod, None);
        assert_eq!(status.phase, PodPhase::Succeeded);
        assert!(status
            .conditions
            .iter()
            .all(|c| c.status == ConditionStatus::False));
        assert_eq!(status.pod_ip.as_deref(), Some("127.0.0.1"));
        assert_eq!(status.pod_ips.len(), 1);
    }

    #[test]
    fn all_terminated_means_succeeded() {
        let pod = pod_with_states(vec![BizState::Deactivated, BizState::Deactivated]);
        let status = build_pod_status("127.0.0.1", &pod, None);

        assert_eq!(status.phase, PodPhase::Succeeded);
        assert!(status
            .conditions
            .iter()
            .all(|c| c.status == ConditionStatus::False));
    }

    #[test]
    fn all_uninitialized_means_pending() {
        let pod = make_pod(vec![biz_container("biz-a"), biz_container("biz-b")]);
        let status = build_pod_status("127.0.0.1", &pod, None);

        assert_eq!(status.phase, PodPhase::Pending);
        assert!(status
            .conditions
            .iter()
            .all(|c| c.status == ConditionStatus::False));
    }

    #[test]
    fn all_ready_means_running_true() {
        let pod = pod_with_states(vec![BizState::Activated, BizState::Activated]);
        let status = build_pod_status("127.0.0.1", &pod, None);

        assert_eq!(status.phase, PodPhase::Running);
        assert!(status
            .conditions
            .iter()
            .all(|c| c.status == ConditionStatus::True));
        assert_eq!(status.conditions.len(), 2);
        assert_eq!(status.conditions[0].condition_type, CONDITION_READY);
        assert_eq!(
            status.conditions[1].condition_type,
            CONDITION_CONTAINERS_READY
        );
    }

    #[test]
    fn mixed_states_mean_running_false() {
        // One activated, one resolved, one deactivated.
        let pod = pod_with_states(vec![
            BizState::Activated,
            BizState::Resolved,
            BizState::Deactivated,
        ]);
        let status = build_pod_status("127.0.0.1", &pod, None);

        assert_eq!(status.phase, PodPhase::Running);
        assert!(status
            .conditions
            .iter()
            .all(|c| c.status == ConditionStatus::False));
    }

    #[test]
    fn aggregation_is_deterministic() {
        let pod = pod_with_states(vec![BizState::Activated, BizState::Broken]);
        let first = build_pod_status("127.0.0.1", &pod, None);
        let second = build_pod_status("127.0.0.1", &pod, None);

        assert_eq!(first.phase, second.phase);
        assert_eq!(first.container_statuses, second.container_statuses);
    }
}
