//! Tests for request coalescing, cancellation and mutation ordering.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use canopy::{
    CategoryOverride, CollectionId, ContainerId, DisplaySurface, EngineConfig, HierarchyNode,
    ItemId, MemoryDataset, MutationOutcome, ResolveOutcome, SurfaceRead, ViewState,
    VisibilityError, VisibilityHandler, VisibilityStatus,
};
use futures_util::future::join_all;

fn dataset() -> Arc<MemoryDataset> {
    Arc::new(
        MemoryDataset::new()
            .with_item(1, 100, 10)
            .with_item(2, 100, 20)
            .with_item(3, 200, 10)
            .with_item(4, 300, 30),
    )
}

fn counter(handler: &VisibilityHandler) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let slot = count.clone();
    handler.on_visibility_change().connect(move |()| {
        slot.fetch_add(1, Ordering::SeqCst);
    });
    count
}

#[tokio::test]
async fn test_concurrent_resolves_share_one_structural_query() {
    let dataset = dataset();
    let view = Arc::new(ViewState::new().with_containers_shown(
        [100, 200, 300].into_iter().map(ContainerId::new),
    ));
    let handler = VisibilityHandler::new(dataset.clone(), view, EngineConfig::default()).unwrap();

    let nodes: Vec<HierarchyNode> = [100, 200, 300]
        .into_iter()
        .map(HierarchyNode::container)
        .collect();
    let outcomes = join_all(nodes.iter().map(|node| handler.resolve(node))).await;

    for outcome in outcomes {
        assert_eq!(outcome.unwrap(), ResolveOutcome::Resolved(VisibilityStatus::Hidden));
    }
    assert_eq!(dataset.query_count("container-collections"), 1);
    assert_eq!(dataset.query_count("sub-models"), 1);

    // Cached facts are reused by later resolves.
    handler.resolve(&nodes[0]).await.unwrap();
    assert_eq!(dataset.query_count("container-collections"), 1);
}

#[tokio::test]
async fn test_concurrent_counts_are_batched() {
    let dataset = dataset();
    let view = Arc::new(
        ViewState::new()
            .with_containers_shown([ContainerId::new(100), ContainerId::new(200)])
            .with_never_shown([1, 3].map(ItemId::new)),
    );
    let handler = VisibilityHandler::new(dataset.clone(), view, EngineConfig::default()).unwrap();

    let nodes = [
        HierarchyNode::collection(10, [ContainerId::new(100)]),
        HierarchyNode::collection(10, [ContainerId::new(200)]),
    ];
    let outcomes = join_all(nodes.iter().map(|node| handler.resolve(node))).await;
    for outcome in outcomes {
        assert_eq!(outcome.unwrap().status(), Some(VisibilityStatus::Hidden));
    }
    assert_eq!(dataset.query_count("item-counts"), 1);
}

#[tokio::test]
async fn test_restart_tokens_are_stable_per_query() {
    let dataset = dataset();
    let view = Arc::new(ViewState::new().with_containers_shown([ContainerId::new(100)]));
    let config = EngineConfig::default().with_restart_token_prefix("tree-a");
    let handler = VisibilityHandler::new(dataset.clone(), view, config).unwrap();

    dataset.fail_next("container-collections", canopy::QueryError::Failed("offline".into()));
    let node = HierarchyNode::container(100);
    assert!(handler.resolve(&node).await.is_err());
    handler.resolve(&node).await.unwrap();

    let tokens: Vec<String> = dataset
        .query_log()
        .into_iter()
        .filter(|entry| entry.query.relationship() == "container-collections")
        .map(|entry| entry.restart.to_string())
        .collect();
    assert_eq!(tokens.len(), 2);
    assert_eq!(tokens[0], tokens[1]);
    assert!(tokens[0].starts_with("tree-a/"));
    assert!(tokens[0].ends_with("/container-collections"));
}

#[tokio::test]
async fn test_waiting_mutation_for_same_node_is_superseded() {
    let dataset = dataset();
    let view = Arc::new(ViewState::new());
    let handler = VisibilityHandler::new(dataset.clone(), view.clone(), EngineConfig::default())
        .unwrap();
    let notifications = counter(&handler);
    let walls = HierarchyNode::collection(10, [ContainerId::new(100)]);

    dataset.pause();
    let (first, (second, third), ()) = tokio::join!(
        handler.set_visibility(&walls, true),
        async {
            // Let the first mutation start and block on its query.
            tokio::time::sleep(Duration::from_millis(10)).await;
            tokio::join!(
                handler.set_visibility(&walls, false),
                handler.set_visibility(&walls, true),
            )
        },
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            dataset.resume();
        },
    );

    assert!(matches!(first.unwrap(), MutationOutcome::Applied { .. }));
    assert_eq!(second.unwrap(), MutationOutcome::Superseded);
    assert!(matches!(third.unwrap(), MutationOutcome::Applied { .. }));

    assert_eq!(
        view.category_override(ContainerId::new(100), CollectionId::new(10)),
        CategoryOverride::Show
    );
    // The whole burst is reported once.
    assert_eq!(notifications.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_mutations_apply_in_submission_order() {
    let dataset = dataset();
    let view = Arc::new(ViewState::new());
    let handler = VisibilityHandler::new(dataset.clone(), view.clone(), EngineConfig::default())
        .unwrap();

    let model = HierarchyNode::container(100);
    let walls = HierarchyNode::collection(10, [ContainerId::new(100)]);
    let (shown, hidden) = tokio::join!(
        handler.set_visibility(&walls, true),
        handler.set_visibility(&model, false),
    );
    shown.unwrap();
    hidden.unwrap();

    assert!(!view.is_container_shown(ContainerId::new(100)));
    assert_eq!(
        view.category_override(ContainerId::new(100), CollectionId::new(10)),
        CategoryOverride::None
    );
    assert_eq!(
        handler.resolve(&model).await.unwrap().status(),
        Some(VisibilityStatus::Hidden)
    );
}

#[tokio::test]
async fn test_mutation_supersedes_in_flight_resolve() {
    let dataset = dataset();
    let view = Arc::new(ViewState::new());
    let handler = VisibilityHandler::new(dataset.clone(), view, EngineConfig::default()).unwrap();
    let model = HierarchyNode::container(100);

    dataset.pause();
    let (resolved, mutated) = tokio::join!(handler.resolve(&model), async {
        tokio::time::sleep(Duration::from_millis(10)).await;
        let (outcome, ()) = tokio::join!(handler.set_visibility(&model, true), async {
            dataset.resume();
        });
        outcome
    });

    assert_eq!(resolved.unwrap(), ResolveOutcome::Superseded);
    assert!(matches!(mutated.unwrap(), MutationOutcome::Applied { .. }));
    assert_eq!(
        handler.resolve(&model).await.unwrap(),
        ResolveOutcome::Resolved(VisibilityStatus::Visible)
    );
}

#[tokio::test]
async fn test_independent_handlers_do_not_share_state() {
    let dataset = dataset();
    let second_view = Arc::new(ViewState::new());
    let first =
        VisibilityHandler::new(dataset.clone(), Arc::new(ViewState::new()), EngineConfig::default())
            .unwrap();
    let second =
        VisibilityHandler::new(dataset.clone(), second_view.clone(), EngineConfig::default())
            .unwrap();

    let model = HierarchyNode::container(100);
    first.set_visibility(&model, true).await.unwrap();

    assert_eq!(
        first.resolve(&model).await.unwrap().status(),
        Some(VisibilityStatus::Visible)
    );
    assert_eq!(
        second.resolve(&model).await.unwrap().status(),
        Some(VisibilityStatus::Hidden)
    );
    assert!(second_view.shown_containers().is_empty());
}

#[tokio::test]
async fn test_dispose_releases_everything() {
    let dataset = dataset();
    let view = Arc::new(ViewState::new());
    let handler = VisibilityHandler::new(dataset.clone(), view.clone(), EngineConfig::default())
        .unwrap();
    let notifications = counter(&handler);

    handler.resolve(&HierarchyNode::container(100)).await.unwrap();
    handler.dispose();

    view.set_containers_shown(&[ContainerId::new(100)], true);
    assert_eq!(notifications.load(Ordering::SeqCst), 0);
    assert!(matches!(handler.flush().await, Err(VisibilityError::Disposed)));
    assert!(matches!(
        handler.resolve(&HierarchyNode::container(100)).await,
        Err(VisibilityError::Disposed)
    ));
}

#[tokio::test]
async fn test_dropping_handler_disconnects_from_surface() {
    let view = Arc::new(ViewState::new());
    {
        let _handler =
            VisibilityHandler::new(dataset(), view.clone(), EngineConfig::default()).unwrap();
        assert_eq!(view.changed().connection_count(), 1);
    }
    assert_eq!(view.changed().connection_count(), 0);
}

#[tokio::test]
async fn test_flush_waits_for_submitted_mutations() {
    let dataset = dataset();
    let view = Arc::new(ViewState::new());
    let handler = VisibilityHandler::new(dataset.clone(), view.clone(), EngineConfig::default())
        .unwrap();
    let model = HierarchyNode::container(100);

    let (applied, flushed) = tokio::join!(handler.set_visibility(&model, true), async {
        handler.flush().await.unwrap();
        view.is_container_shown(ContainerId::new(100))
    });

    assert!(matches!(applied.unwrap(), MutationOutcome::Applied { .. }));
    assert!(flushed);
}

#[tokio::test]
async fn test_external_change_during_pending_mutation_reaches_resolves() {
    let dataset = dataset();
    let view = Arc::new(
        ViewState::new()
            .with_containers_shown([ContainerId::new(100)])
            .with_category_selector_on([10, 20].map(CollectionId::new)),
    );
    let handler = VisibilityHandler::new(dataset.clone(), view.clone(), EngineConfig::default())
        .unwrap();
    let notifications = counter(&handler);
    let model = HierarchyNode::container(100);
    assert_eq!(
        handler.resolve(&model).await.unwrap(),
        ResolveOutcome::Resolved(VisibilityStatus::Visible)
    );

    // The mutation blocks on its child-items query while the view changes.
    dataset.pause();
    let item = HierarchyNode::item(2, 100, 20);
    let (mutated, resolved) = tokio::join!(
        handler.set_visibility(&item, false),
        async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            view.set_containers_shown(&[ContainerId::new(100)], false);
            let resolved = handler.resolve(&model).await;
            dataset.resume();
            resolved
        },
    );

    mutated.unwrap();
    assert_eq!(
        resolved.unwrap(),
        ResolveOutcome::Resolved(VisibilityStatus::Hidden)
    );
    // Held back until the mutation finished, then reported once.
    assert_eq!(notifications.load(Ordering::SeqCst), 1);
}
