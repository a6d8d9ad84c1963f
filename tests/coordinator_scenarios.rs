mod support;

use netshare::{
    CoordinatorState, InterfaceStatus, NetShareError, ShareErrorType, ShareNotification, UpstreamCapabilities,
};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use support::{cellular, drain, harness, harness_with, names, test_config, wifi};

#[tokio::test]
async fn test_enable_without_upstream_waits_in_alive() {
    let h = harness();
    let mut rx = h.coordinator.subscribe();

    h.coordinator.enable("hotspot", &names(&["wlan1"])).await.unwrap();

    let status = h.coordinator.status().await;
    assert_eq!(status.state, CoordinatorState::Alive);
    assert_eq!(status.requester.as_deref(), Some("hotspot"));
    assert_eq!(status.active_interfaces, names(&["wlan1"]));
    assert!(!status.forwarding);
    assert!(status.current_upstream.is_none());
    assert!(h.link.is_up("wlan1"));
    assert!(h.monitor.is_subscribed());
    assert_eq!(
        drain(&mut rx),
        vec![ShareNotification::SharingStarted {
            requester: "hotspot".into()
        }]
    );
}

#[tokio::test]
async fn test_upstream_added_applies_forwarding() {
    let h = harness();
    h.coordinator.enable("hotspot", &names(&["wlan1"])).await.unwrap();
    let mut rx = h.coordinator.subscribe();

    h.monitor.add_network(cellular("rmnet0"));
    h.settle().await;

    assert!(h.coordinator.has_set_forward().await);
    assert!(h.forwarding.has_pair("wlan1", "rmnet0"));
    assert_eq!(
        h.coordinator.status().await.current_upstream.as_deref(),
        Some("rmnet0")
    );
    assert_eq!(
        drain(&mut rx),
        vec![ShareNotification::UpstreamChanged {
            upstream: Some("rmnet0".into())
        }]
    );
}

#[tokio::test]
async fn test_upstream_removed_stays_alive() {
    let h = harness();
    h.coordinator.enable("hotspot", &names(&["wlan1"])).await.unwrap();
    h.monitor.add_network(cellular("rmnet0"));
    h.settle().await;

    h.monitor.remove_network("rmnet0");
    h.settle().await;

    assert_eq!(h.coordinator.state().await, CoordinatorState::Alive);
    assert!(!h.coordinator.has_set_forward().await);
    assert!(h.forwarding.pairs().is_empty());
    assert!(h.link.is_up("wlan1"));
}

#[tokio::test]
async fn test_apply_failure_enters_error_then_clears() {
    let h = harness();
    let mut rx = h.coordinator.subscribe();
    h.coordinator.enable("hotspot", &names(&["wlan1"])).await.unwrap();

    h.forwarding.fail_apply(true);
    h.monitor.add_network(cellular("rmnet0"));
    h.settle().await;

    assert_eq!(h.coordinator.state().await, CoordinatorState::Error);
    assert_eq!(
        h.coordinator.error_type().await,
        Some(ShareErrorType::ForwardingFailed)
    );
    assert!(!h.link.any_up());
    assert!(!h.monitor.is_subscribed());
    assert!(h.coordinator.status().await.active_interfaces.is_empty());

    h.coordinator.clear_error().await.unwrap();

    let status = h.coordinator.status().await;
    assert_eq!(status.state, CoordinatorState::Init);
    assert!(!status.forwarding);
    assert!(status.error.is_none());
    assert_eq!(
        drain(&mut rx),
        vec![
            ShareNotification::SharingStarted {
                requester: "hotspot".into()
            },
            ShareNotification::SharingError {
                error: ShareErrorType::ForwardingFailed
            },
            ShareNotification::Recovered,
        ]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_inactive_tears_down_once() {
    for _ in 0..25 {
        let h = harness();
        h.coordinator
            .enable("hotspot", &names(&["wlan1", "usb0"]))
            .await
            .unwrap();
        h.monitor.add_network(wifi("wlan0"));
        h.settle().await;
        let mut rx = h.coordinator.subscribe();

        let a = {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move { coordinator.interface_changed("wlan1", InterfaceStatus::Inactive).await })
        };
        let b = {
            let coordinator = h.coordinator.clone();
            tokio::spawn(async move { coordinator.interface_changed("usb0", InterfaceStatus::Inactive).await })
        };
        a.await.unwrap().unwrap();
        b.await.unwrap().unwrap();

        let stopped = drain(&mut rx)
            .into_iter()
            .filter(|n| matches!(n, ShareNotification::SharingStopped { .. }))
            .count();
        assert_eq!(stopped, 1);
        assert_eq!(h.coordinator.state().await, CoordinatorState::Init);
        assert!(h.forwarding.pairs().is_empty());
    }
}

#[tokio::test]
async fn test_enable_is_idempotent() {
    let h = harness();
    let mut rx = h.coordinator.subscribe();
    h.monitor.add_network(cellular("rmnet0"));

    h.coordinator.enable("hotspot", &names(&["wlan1"])).await.unwrap();
    let applies = h.forwarding.applies();
    h.coordinator.enable("hotspot", &names(&["wlan1"])).await.unwrap();

    assert_eq!(h.coordinator.state().await, CoordinatorState::Alive);
    assert_eq!(h.forwarding.applies(), applies);
    assert_eq!(h.forwarding.pairs().len(), 1);
    let started = drain(&mut rx)
        .into_iter()
        .filter(|n| matches!(n, ShareNotification::SharingStarted { .. }))
        .count();
    assert_eq!(started, 1);
}

#[tokio::test]
async fn test_disable_while_idle_is_noop() {
    let h = harness();
    let before = h.coordinator.status().await;

    h.coordinator.disable("hotspot").await.unwrap();

    let after = h.coordinator.status().await;
    assert_eq!(after.state, before.state);
    assert_eq!(after.requester, before.requester);
    assert!(!h.link.any_up());
}

#[tokio::test]
async fn test_enable_disable_round_trip() {
    let h = harness();
    let before = h.coordinator.status().await;

    h.coordinator
        .enable("hotspot", &names(&["wlan1", "usb0"]))
        .await
        .unwrap();
    h.monitor.add_network(wifi("wlan0"));
    h.settle().await;
    assert_eq!(h.forwarding.pairs().len(), 2);

    h.coordinator.disable("hotspot").await.unwrap();

    let after = h.coordinator.status().await;
    assert_eq!(after.state, before.state);
    assert_eq!(after.requester, before.requester);
    assert_eq!(after.active_interfaces, before.active_interfaces);
    assert_eq!(after.current_upstream, before.current_upstream);
    assert_eq!(after.forwarding, before.forwarding);
    assert_eq!(after.error, before.error);
    assert!(after.since.is_none());
    assert!(h.forwarding.pairs().is_empty());
    assert!(!h.link.any_up());
    assert!(!h.monitor.is_subscribed());
}

#[tokio::test]
async fn test_preference_list_picks_upstream() {
    let h = harness();
    h.coordinator.enable("hotspot", &names(&["wlan1"])).await.unwrap();

    h.monitor.add_network(cellular("rmnet0"));
    h.settle().await;
    assert!(h.forwarding.has_pair("wlan1", "rmnet0"));

    h.monitor.add_network(wifi("wlan0"));
    h.settle().await;
    assert_eq!(h.forwarding.pairs(), vec![("wlan1".to_string(), "wlan0".to_string())]);

    h.monitor.remove_network("wlan0");
    h.settle().await;
    assert_eq!(h.forwarding.pairs(), vec![("wlan1".to_string(), "rmnet0".to_string())]);
}

#[tokio::test]
async fn test_lost_validation_drops_forwarding() {
    let h = harness();
    h.coordinator.enable("hotspot", &names(&["wlan1"])).await.unwrap();
    h.monitor.add_network(cellular("rmnet0"));
    h.settle().await;

    h.monitor.update_capabilities(
        "rmnet0",
        UpstreamCapabilities {
            validated: false,
            ..UpstreamCapabilities::metered()
        },
    );
    h.settle().await;

    assert_eq!(h.coordinator.state().await, CoordinatorState::Alive);
    assert!(!h.coordinator.has_set_forward().await);
    assert!(h.forwarding.pairs().is_empty());
}

#[tokio::test]
async fn test_added_downstream_joins_forwarding() {
    let h = harness();
    h.coordinator.enable("hotspot", &names(&["wlan1"])).await.unwrap();
    h.monitor.add_network(cellular("rmnet0"));
    h.settle().await;

    h.coordinator
        .enable("hotspot", &names(&["wlan1", "usb0"]))
        .await
        .unwrap();

    assert!(h.forwarding.has_pair("usb0", "rmnet0"));
    assert_eq!(h.coordinator.status().await.active_interfaces.len(), 2);
}

#[tokio::test]
async fn test_link_notification_through_inbox() {
    let h = harness();
    h.coordinator.enable("hotspot", &names(&["wlan1"])).await.unwrap();

    h.coordinator.notify_interface("wlan1", InterfaceStatus::Inactive);
    h.settle().await;

    assert_eq!(h.coordinator.state().await, CoordinatorState::Init);
    assert!(h.coordinator.status().await.requester.is_none());
}

#[tokio::test]
async fn test_unregister_last_interface_ends_session() {
    let h = harness();
    let mut rx = h.coordinator.subscribe();
    h.coordinator.enable("hotspot", &names(&["wlan1"])).await.unwrap();

    h.coordinator.unregister_interface("wlan1").await.unwrap();

    assert_eq!(h.coordinator.state().await, CoordinatorState::Init);
    assert!(!h.link.is_up("wlan1"));
    assert!(drain(&mut rx).contains(&ShareNotification::SharingStopped {
        requester: "hotspot".into()
    }));
    assert!(matches!(
        h.coordinator.unregister_interface("wlan1").await,
        Err(NetShareError::UnknownInterface(_))
    ));
}

#[tokio::test]
async fn test_request_errors_leave_state_alone() {
    let h = harness();

    assert!(matches!(
        h.coordinator.enable("hotspot", &[]).await,
        Err(NetShareError::NoDownstreamInterface)
    ));

    h.coordinator.enable("hotspot", &names(&["wlan1"])).await.unwrap();
    assert!(matches!(
        h.coordinator.enable("usb", &names(&["usb0"])).await,
        Err(NetShareError::AlreadySharing { .. })
    ));
    assert!(matches!(
        h.coordinator.disable("usb").await,
        Err(NetShareError::RequesterMismatch { .. })
    ));

    let status = h.coordinator.status().await;
    assert_eq!(status.state, CoordinatorState::Alive);
    assert_eq!(status.requester.as_deref(), Some("hotspot"));
    assert!(!h.link.is_up("usb0"));
}

#[tokio::test]
async fn test_missing_interface_is_rejected() {
    let h = harness();
    h.link.set_missing("wlan1");

    assert!(matches!(
        h.coordinator.enable("hotspot", &names(&["wlan1"])).await,
        Err(NetShareError::NoDownstreamInterface)
    ));
    assert_eq!(h.coordinator.state().await, CoordinatorState::Init);
}

#[tokio::test]
async fn test_activation_failure_is_local() {
    let h = harness();
    h.link.fail_up("wlan1");

    assert!(matches!(
        h.coordinator.enable("hotspot", &names(&["wlan1"])).await,
        Err(NetShareError::ActivationFailed { .. })
    ));
    let status = h.coordinator.status().await;
    assert_eq!(status.state, CoordinatorState::Init);
    assert!(status.requester.is_none());
    assert!(status.error.is_none());

    // One good interface is enough.
    h.coordinator
        .enable("hotspot", &names(&["wlan1", "usb0"]))
        .await
        .unwrap();
    assert_eq!(
        h.coordinator.status().await.active_interfaces,
        names(&["usb0"])
    );
}

#[tokio::test]
async fn test_enable_rejected_in_error() {
    let h = harness();
    h.coordinator
        .switch_to_error_state(ShareErrorType::PermissionLost)
        .await;

    assert!(matches!(
        h.coordinator.enable("hotspot", &names(&["wlan1"])).await,
        Err(NetShareError::InErrorState {
            error: ShareErrorType::PermissionLost
        })
    ));

    // A trivial error never overwrites the recorded one.
    h.coordinator
        .switch_to_error_state(ShareErrorType::Unspecified)
        .await;
    assert_eq!(
        h.coordinator.error_type().await,
        Some(ShareErrorType::PermissionLost)
    );
}

#[tokio::test(start_paused = true)]
async fn test_collaborator_timeout_is_systemic() {
    let h = harness();
    h.link.hang(true);

    assert!(matches!(
        h.coordinator.enable("hotspot", &names(&["wlan1"])).await,
        Err(NetShareError::SharingFailed {
            error: ShareErrorType::Timeout
        })
    ));
    assert_eq!(h.coordinator.state().await, CoordinatorState::Error);
    assert!(h.coordinator.status().await.requester.is_none());
}

#[tokio::test]
async fn test_stuck_interface_blocks_error_clear() {
    let h = harness();
    h.coordinator.enable("hotspot", &names(&["wlan1"])).await.unwrap();
    h.link.stick_up("wlan1", true);

    assert!(matches!(
        h.coordinator.disable("hotspot").await,
        Err(NetShareError::SharingFailed {
            error: ShareErrorType::InterfaceControl
        })
    ));
    assert_eq!(h.coordinator.state().await, CoordinatorState::Error);

    h.coordinator.clear_error().await.unwrap();
    assert_eq!(h.coordinator.state().await, CoordinatorState::Error);

    h.link.stick_up("wlan1", false);
    h.coordinator.clear_error().await.unwrap();
    assert_eq!(h.coordinator.state().await, CoordinatorState::Init);
    assert!(!h.link.any_up());
}

#[tokio::test]
async fn test_monitor_fault_recovers_automatically() {
    let h = harness_with(netshare::Config {
        auto_clear_errors: true,
        ..test_config()
    });
    let mut rx = h.coordinator.subscribe();
    h.coordinator.enable("hotspot", &names(&["wlan1"])).await.unwrap();

    h.monitor.report_fault("netlink socket closed");
    h.settle().await;

    assert_eq!(h.coordinator.state().await, CoordinatorState::Init);
    assert!(!h.link.any_up());
    assert_eq!(
        drain(&mut rx),
        vec![
            ShareNotification::SharingStarted {
                requester: "hotspot".into()
            },
            ShareNotification::SharingError {
                error: ShareErrorType::UpstreamFault
            },
            ShareNotification::Recovered,
        ]
    );
}

#[tokio::test]
async fn test_shutdown_releases_everything() {
    let h = harness();
    h.coordinator
        .enable("hotspot", &names(&["wlan1", "usb0"]))
        .await
        .unwrap();
    h.monitor.add_network(wifi("wlan0"));
    h.settle().await;

    h.coordinator.shutdown().await;

    assert_eq!(h.coordinator.state().await, CoordinatorState::Init);
    assert!(h.forwarding.pairs().is_empty());
    assert!(!h.link.any_up());
    assert!(h.coordinator.status().await.active_interfaces.is_empty());
    assert!(!h.monitor.is_subscribed());
}

#[tokio::test]
async fn test_random_event_streams_keep_invariants() {
    const IFACES: &[&str] = &["wlan1", "usb0", "bt-pan"];
    const UPSTREAMS: &[&str] = &["rmnet0", "wlan0", "eth0"];
    const REQUESTERS: &[&str] = &["hotspot", "usb"];

    for seed in 0..16u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let h = harness();

        for step in 0..80 {
            match rng.gen_range(0..10) {
                0 | 1 => {
                    let requester = REQUESTERS.choose(&mut rng).unwrap();
                    let picked: Vec<&str> = IFACES.iter().copied().filter(|_| rng.gen_bool(0.5)).collect();
                    let _ = h.coordinator.enable(requester, &names(&picked)).await;
                }
                2 => {
                    let requester = REQUESTERS.choose(&mut rng).unwrap();
                    let _ = h.coordinator.disable(requester).await;
                }
                3 | 4 => {
                    let iface = IFACES.choose(&mut rng).unwrap();
                    let status = if rng.gen_bool(0.5) {
                        InterfaceStatus::Active
                    } else {
                        InterfaceStatus::Inactive
                    };
                    h.coordinator.notify_interface(iface, status);
                }
                5 => {
                    let iface = UPSTREAMS.choose(&mut rng).unwrap();
                    if rng.gen_bool(0.5) {
                        h.monitor.add_network(cellular(iface));
                    } else {
                        h.monitor.add_network(wifi(iface));
                    }
                }
                6 => h.monitor.remove_network(UPSTREAMS.choose(&mut rng).unwrap()),
                7 => {
                    if rng.gen_bool(0.2) {
                        h.monitor.report_fault("injected");
                    } else {
                        h.forwarding.fail_apply(rng.gen_bool(0.3));
                    }
                }
                _ => {
                    let _ = h.coordinator.clear_error().await;
                }
            }
            h.settle().await;

            let status = h.coordinator.status().await;
            let pairs = h.forwarding.pairs();
            let context = format!("seed {} step {}: {:?} pairs {:?}", seed, step, status, pairs);

            if status.forwarding {
                assert_eq!(status.state, CoordinatorState::Alive, "{}", context);
            }
            if status.state != CoordinatorState::Alive {
                assert!(pairs.is_empty(), "{}", context);
                assert!(status.current_upstream.is_none(), "{}", context);
            }
            assert!(pairs.is_empty() || status.forwarding, "{}", context);
            for (downstream, upstream) in &pairs {
                assert_eq!(status.current_upstream.as_ref(), Some(upstream), "{}", context);
                assert!(status.active_interfaces.contains(downstream), "{}", context);
            }
        }
    }
}

#[tokio::test]
async fn test_rejected_request_leaves_no_binding() {
    let h = harness();
    h.coordinator.enable("hotspot", &names(&["wlan1"])).await.unwrap();

    assert!(matches!(
        h.coordinator.enable("usb", &names(&["usb0"])).await,
        Err(NetShareError::AlreadySharing { .. })
    ));

    // A later link-up for the rejected interface goes nowhere.
    h.coordinator.notify_interface("usb0", InterfaceStatus::Active);
    h.settle().await;

    assert_eq!(h.coordinator.status().await.active_interfaces, names(&["wlan1"]));
    assert!(!h.link.is_up("usb0"));
    assert!(matches!(
        h.coordinator.unregister_interface("usb0").await,
        Err(NetShareError::UnknownInterface(_))
    ));
}

#[tokio::test]
async fn test_request_rejected_in_error_leaves_no_binding() {
    let h = harness();
    h.coordinator
        .switch_to_error_state(ShareErrorType::PermissionLost)
        .await;

    assert!(h.coordinator.enable("hotspot", &names(&["wlan1"])).await.is_err());
    assert!(matches!(
        h.coordinator.unregister_interface("wlan1").await,
        Err(NetShareError::UnknownInterface(_))
    ));
}

#[tokio::test]
async fn test_link_up_outside_session_is_ignored() {
    let h = harness();
    h.coordinator.register_interface("usb0").await.unwrap();

    h.coordinator.notify_interface("usb0", InterfaceStatus::Active);
    h.settle().await;
    assert_eq!(h.coordinator.state().await, CoordinatorState::Init);
    assert!(!h.link.is_up("usb0"));

    h.coordinator.enable("hotspot", &names(&["wlan1"])).await.unwrap();
    h.monitor.add_network(cellular("rmnet0"));
    h.settle().await;

    h.coordinator.notify_interface("usb0", InterfaceStatus::Active);
    h.settle().await;

    assert_eq!(h.coordinator.status().await.active_interfaces, names(&["wlan1"]));
    assert!(!h.forwarding.has_pair("usb0", "rmnet0"));
    assert!(!h.link.is_up("usb0"));
}

#[tokio::test]
async fn test_stale_monitor_fault_skips_next_session() {
    let h = harness();
    h.coordinator.enable("hotspot", &names(&["wlan1"])).await.unwrap();
    h.monitor.report_fault("netlink socket closed");
    h.coordinator.disable("hotspot").await.unwrap();
    assert_eq!(h.coordinator.state().await, CoordinatorState::Init);

    h.coordinator.enable("usb", &names(&["usb0"])).await.unwrap();
    h.settle().await;

    let status = h.coordinator.status().await;
    assert_eq!(status.state, CoordinatorState::Alive);
    assert_eq!(status.requester.as_deref(), Some("usb"));

    // The new subscription still delivers.
    h.monitor.add_network(cellular("rmnet0"));
    h.settle().await;
    assert!(h.forwarding.has_pair("usb0", "rmnet0"));
}

#[tokio::test]
async fn test_failed_removal_on_disable_holds_error() {
    let h = harness();
    let mut rx = h.coordinator.subscribe();
    h.coordinator.enable("hotspot", &names(&["wlan1"])).await.unwrap();
    h.monitor.add_network(cellular("rmnet0"));
    h.settle().await;

    h.forwarding.fail_remove(true);
    assert!(matches!(
        h.coordinator.disable("hotspot").await,
        Err(NetShareError::SharingFailed {
            error: ShareErrorType::ForwardingFailed
        })
    ));
    assert_eq!(h.coordinator.state().await, CoordinatorState::Error);
    assert!(h.forwarding.has_pair("wlan1", "rmnet0"));

    // Cleanup is incomplete, so clearing waits.
    h.coordinator.clear_error().await.unwrap();
    assert_eq!(h.coordinator.state().await, CoordinatorState::Error);
    assert!(h.forwarding.has_pair("wlan1", "rmnet0"));

    h.forwarding.fail_remove(false);
    h.coordinator.clear_error().await.unwrap();

    let status = h.coordinator.status().await;
    assert_eq!(status.state, CoordinatorState::Init);
    assert!(status.error.is_none());
    assert!(h.forwarding.pairs().is_empty());
    assert!(!h.link.any_up());
    assert!(drain(&mut rx).contains(&ShareNotification::SharingError {
        error: ShareErrorType::ForwardingFailed
    }));
}

#[tokio::test]
async fn test_failed_removal_on_upstream_change_enters_error() {
    let h = harness();
    h.coordinator.enable("hotspot", &names(&["wlan1"])).await.unwrap();
    h.monitor.add_network(cellular("rmnet0"));
    h.settle().await;

    h.forwarding.fail_remove(true);
    h.monitor.add_network(wifi("wlan0"));
    h.settle().await;

    assert_eq!(h.coordinator.state().await, CoordinatorState::Error);
    assert_eq!(
        h.coordinator.error_type().await,
        Some(ShareErrorType::ForwardingFailed)
    );
    assert!(!h.forwarding.has_pair("wlan1", "wlan0"));

    h.forwarding.fail_remove(false);
    h.coordinator.clear_error().await.unwrap();
    assert_eq!(h.coordinator.state().await, CoordinatorState::Init);
    assert!(h.forwarding.pairs().is_empty());
}

#[tokio::test]
async fn test_shutdown_continues_after_failed_disable() {
    let h = harness();
    h.coordinator.enable("hotspot", &names(&["wlan1"])).await.unwrap();
    h.monitor.add_network(cellular("rmnet0"));
    h.settle().await;

    h.forwarding.fail_remove(true);
    h.coordinator.shutdown().await;

    let status = h.coordinator.status().await;
    assert_eq!(status.state, CoordinatorState::Error);
    assert!(status.active_interfaces.is_empty());
    assert!(!h.monitor.is_subscribed());
    assert!(matches!(
        h.coordinator.unregister_interface("wlan1").await,
        Err(NetShareError::UnknownInterface(_))
    ));
}
