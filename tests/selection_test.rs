use cascade::clock::Clock;
use cascade::testing::TestTree;
use cascade::topology::{Source, TopologyView, TreeSettings, TIME_KEY};
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::time::Duration;

const SELF: &str = "n1.example";

fn node(bootstrap: &[&str]) -> TestTree {
    TestTree::with(
        SELF,
        "10.0.0.9",
        bootstrap.iter().map(|s| s.to_string()).collect(),
        TreeSettings::default(),
    )
}

fn view(root: Option<&str>, branches: &[&str]) -> TopologyView {
    TopologyView {
        root: root.map(str::to_string),
        branches: branches.iter().map(|s| s.to_string()).collect::<BTreeSet<_>>(),
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

#[tokio::test]
async fn fresh_seed_is_selected_without_a_view() {
    let n = node(&["seed1"]);
    n.add_peer("seed1", "10.0.0.5", Some(Duration::ZERO));

    let source = n.tree.select_source(None, false).await;
    assert_eq!(
        source,
        Some(Source {
            host: "seed1".into(),
            ip: "10.0.0.5".parse().unwrap(),
        })
    );
}

#[tokio::test]
async fn root_is_used_when_branches_are_down() {
    let n = node(&[]);
    n.add_peer("b1", "10.0.0.2", Some(Duration::ZERO));
    n.add_peer("b2", "10.0.0.3", Some(Duration::ZERO));
    n.network.set_reachable("b1", false);
    n.network.set_reachable("b2", false);
    n.add_peer("r1", "10.0.0.1", Some(Duration::ZERO));

    let v = view(Some("r1"), &["b1", "b2"]);
    let source = n.tree.select_source(Some(&v), true).await.unwrap();
    assert_eq!(source.host, "r1");
    assert_eq!(source.ip.to_string(), "10.0.0.1");
}

#[tokio::test]
async fn preferred_root_is_probed_first() {
    let n = node(&[]);
    n.add_peer("b1", "10.0.0.2", Some(Duration::ZERO));
    n.add_peer("r1", "10.0.0.1", Some(Duration::ZERO));

    let v = view(Some("r1"), &["b1"]);
    assert_eq!(n.tree.select_source(Some(&v), true).await.unwrap().host, "r1");
    assert_eq!(n.network.dial_count("b1"), 0);

    assert_eq!(n.tree.select_source(Some(&v), false).await.unwrap().host, "b1");
}

#[tokio::test]
async fn stale_and_blank_candidates_are_skipped() {
    let n = node(&["stale", "blank", "garbled", "unresolvable", "fresh"]);
    n.add_peer("stale", "10.0.0.2", Some(Duration::from_secs(30)));
    n.add_peer("blank", "10.0.0.3", None);
    n.add_peer("garbled", "10.0.0.4", None)
        .set_string(TIME_KEY, "not-a-number");
    n.add_peer("fresh", "10.0.0.5", Some(Duration::from_secs(19)));

    let source = n.tree.select_source(None, false).await.unwrap();
    assert_eq!(source.host, "fresh");
}

#[tokio::test]
async fn non_finite_stamps_are_unparseable() {
    for raw in ["nan", "NaN", "inf", "-inf", "infinity"] {
        let n = node(&["seed1"]);
        n.add_peer("seed1", "10.0.0.5", None).set_string(TIME_KEY, raw);

        assert_eq!(n.tree.select_source(None, false).await, None, "stamp {:?}", raw);
    }
}

#[tokio::test]
async fn candidates_are_tried_in_the_given_order() {
    let n = node(&[]);
    n.add_peer("b1", "10.0.0.2", Some(Duration::ZERO));
    n.add_peer("b2", "10.0.0.3", Some(Duration::ZERO));

    let order = vec!["b2".to_string(), "b1".to_string()];
    let source = n.tree.selector.probe(&n.tree, &order).await.unwrap();
    assert_eq!(source.host, "b2");
    assert_eq!(n.network.dial_count("b1"), 0);
}

#[tokio::test]
async fn all_stale_means_no_source() {
    let n = node(&["s1", "s2"]);
    n.add_peer("s1", "10.0.0.2", Some(Duration::from_secs(25)));
    n.add_peer("s2", "10.0.0.3", Some(Duration::from_secs(300)));

    assert_eq!(n.tree.select_source(None, false).await, None);
}

#[tokio::test]
async fn self_is_never_probed() {
    let n = node(&[SELF]);
    n.local_store()
        .set_string(TIME_KEY, &format!("{:.6}", n.clock.now()));

    let v = view(Some(SELF), &[SELF]);
    assert_eq!(n.tree.select_source(Some(&v), true).await, None);
    assert_eq!(n.network.total_dials(), 0);
}

#[tokio::test]
async fn selection_probes_with_fresh_connections() {
    let n = node(&["seed1"]);
    n.add_peer("seed1", "10.0.0.5", Some(Duration::ZERO));

    n.tree.select_source(None, false).await.unwrap();
    n.tree.select_source(None, false).await.unwrap();
    assert_eq!(n.network.dial_count("seed1"), 2);
}

proptest! {
    #[test]
    fn accepted_iff_within_staleness_threshold(age_ms in 0u64..40_000) {
        let n = node(&["seed1"]);
        n.add_peer("seed1", "10.0.0.5", Some(Duration::from_millis(age_ms)));

        let source = runtime().block_on(n.tree.select_source(None, false));
        prop_assert_eq!(source.is_some(), age_ms <= 20_000);
    }

    #[test]
    fn never_selects_itself(
        bootstrap in prop::collection::vec(0usize..6, 0..8),
        branches in prop::collection::vec(0usize..6, 0..6),
        ages in prop::collection::vec(prop::option::of(0u64..40), 6),
        reachable in prop::collection::vec(any::<bool>(), 6),
        prefer_root in any::<bool>(),
    ) {
        let names: Vec<String> = std::iter::once(SELF.to_string())
            .chain((1..6).map(|i| format!("h{}.example", i)))
            .collect();
        let seeds: Vec<&str> = bootstrap.iter().map(|i| names[*i].as_str()).collect();
        let n = node(&seeds);
        n.local_store().set_string(TIME_KEY, &format!("{:.6}", n.clock.now()));
        for i in 1..6 {
            n.add_peer(&names[i], &format!("10.0.1.{}", i), ages[i].map(Duration::from_secs));
            n.network.set_reachable(&names[i], reachable[i]);
        }
        let branch_names: Vec<&str> = branches.iter().map(|i| names[*i].as_str()).collect();
        let v = view(Some(SELF), &branch_names);

        let source = runtime().block_on(n.tree.select_source(Some(&v), prefer_root));
        if let Some(source) = source {
            prop_assert_ne!(source.host, SELF);
        }
    }
}
