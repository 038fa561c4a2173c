//! Tests for visibility resolution and mutation through the public handler.

use std::collections::HashSet;
use std::sync::Arc;

use canopy::{
    CategoryOverride, CollectionId, ContainerId, DisplaySurface, EngineConfig, HierarchyNode,
    ItemId, MemoryDataset, MutationOutcome, SurfaceRead, ViewState, VisibilityError,
    VisibilityHandler, VisibilityStatus,
};
use tracing_subscriber::EnvFilter;

const M1: u64 = 100;
const C1: u64 = 10;
const C2: u64 = 20;
const E1: u64 = 1;
const E2: u64 = 2;
const E3: u64 = 3;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// M1 with C1 = [e1, e2] and C2 = [e3].
fn dataset() -> Arc<MemoryDataset> {
    Arc::new(
        MemoryDataset::new()
            .with_item(E1, M1, C1)
            .with_item(E2, M1, C1)
            .with_item(E3, M1, C2),
    )
}

fn handler_over(view: Arc<ViewState>) -> VisibilityHandler {
    init_tracing();
    VisibilityHandler::new(dataset(), view, EngineConfig::default()).unwrap()
}

fn model() -> HierarchyNode {
    HierarchyNode::container(M1)
}

fn category(id: u64) -> HierarchyNode {
    HierarchyNode::collection(id, [ContainerId::new(M1)])
}

fn element(id: u64, collection: u64) -> HierarchyNode {
    HierarchyNode::item(id, M1, collection)
}

async fn status(handler: &VisibilityHandler, node: &HierarchyNode) -> VisibilityStatus {
    handler
        .resolve(node)
        .await
        .unwrap()
        .status()
        .expect("resolve was not interrupted")
}

type Snapshot = (
    Vec<ContainerId>,
    Vec<((ContainerId, CollectionId), CategoryOverride)>,
    Vec<ItemId>,
    Vec<ItemId>,
);

fn snapshot(view: &ViewState) -> Snapshot {
    let mut always: Vec<ItemId> = view.always_shown().into_iter().collect();
    let mut never: Vec<ItemId> = view.never_shown().into_iter().collect();
    always.sort_unstable();
    never.sort_unstable();
    (view.shown_containers(), view.category_overrides(), always, never)
}

#[tokio::test]
async fn test_collection_activation_scenario() {
    let handler = handler_over(Arc::new(ViewState::new()));

    assert_eq!(status(&handler, &model()).await, VisibilityStatus::Hidden);

    handler.set_visibility(&category(C1), true).await.unwrap();

    assert_eq!(status(&handler, &model()).await, VisibilityStatus::Partial);
    assert_eq!(status(&handler, &category(C1)).await, VisibilityStatus::Visible);
    assert_eq!(status(&handler, &category(C2)).await, VisibilityStatus::Hidden);
    assert_eq!(status(&handler, &element(E1, C1)).await, VisibilityStatus::Visible);
    assert_eq!(status(&handler, &element(E3, C2)).await, VisibilityStatus::Hidden);
}

#[tokio::test]
async fn test_never_shown_item_makes_collection_partial() {
    let view = Arc::new(
        ViewState::new()
            .with_containers_shown([ContainerId::new(M1)])
            .with_category_selector_on([CollectionId::new(C1)])
            .with_never_shown([ItemId::new(E2)]),
    );
    let handler = handler_over(view);

    assert_eq!(status(&handler, &category(C1)).await, VisibilityStatus::Partial);
    assert_eq!(status(&handler, &element(E1, C1)).await, VisibilityStatus::Visible);
    assert_eq!(status(&handler, &element(E2, C1)).await, VisibilityStatus::Hidden);
}

#[tokio::test]
async fn test_isolation_on_activation_hides_siblings() {
    let handler = handler_over(Arc::new(ViewState::new()));

    handler.set_visibility(&category(C2), true).await.unwrap();

    assert_eq!(status(&handler, &model()).await, VisibilityStatus::Partial);
    assert_eq!(status(&handler, &category(C1)).await, VisibilityStatus::Hidden);
    assert_eq!(status(&handler, &category(C2)).await, VisibilityStatus::Visible);
}

#[tokio::test]
async fn test_activation_without_isolation_keeps_selector_defaults() {
    init_tracing();
    let view = Arc::new(ViewState::new().with_category_selector_on([CollectionId::new(C1)]));
    let handler = VisibilityHandler::new(
        dataset(),
        view,
        EngineConfig::default().with_isolate_on_activation(false),
    )
    .unwrap();

    handler.set_visibility(&category(C2), true).await.unwrap();

    // C1 follows its selector instead of being forced off.
    assert_eq!(status(&handler, &category(C1)).await, VisibilityStatus::Visible);
    assert_eq!(status(&handler, &model()).await, VisibilityStatus::Visible);
}

#[tokio::test]
async fn test_set_visibility_is_idempotent() {
    let nodes = [
        model(),
        category(C1),
        element(E1, C1),
        HierarchyNode::collection(C2, []),
    ];
    for node in nodes {
        for on in [true, false] {
            let once = Arc::new(ViewState::new().with_never_shown([ItemId::new(E3)]));
            let twice = Arc::new(ViewState::new().with_never_shown([ItemId::new(E3)]));
            let first = handler_over(once.clone());
            let second = handler_over(twice.clone());

            first.set_visibility(&node, on).await.unwrap();
            second.set_visibility(&node, on).await.unwrap();
            second.set_visibility(&node, on).await.unwrap();

            assert_eq!(snapshot(&once), snapshot(&twice), "{} on={on}", node.key());
        }
    }
}

#[tokio::test]
async fn test_item_round_trip_from_any_prior_state() {
    let prior_states: Vec<Arc<ViewState>> = vec![
        Arc::new(ViewState::new()),
        Arc::new(
            ViewState::new()
                .with_containers_shown([ContainerId::new(M1)])
                .with_category_selector_on([CollectionId::new(C1), CollectionId::new(C2)]),
        ),
        Arc::new(
            ViewState::new()
                .with_containers_shown([ContainerId::new(M1)])
                .with_never_shown([ItemId::new(E1), ItemId::new(E3)])
                .with_always_shown([ItemId::new(E2)]),
        ),
    ];

    for view in prior_states {
        let handler = handler_over(view);
        for (item, collection) in [(E1, C1), (E2, C1), (E3, C2)] {
            let node = element(item, collection);

            handler.set_visibility(&node, true).await.unwrap();
            assert_eq!(status(&handler, &node).await, VisibilityStatus::Visible, "{}", node.key());

            handler.set_visibility(&node, false).await.unwrap();
            assert_eq!(status(&handler, &node).await, VisibilityStatus::Hidden, "{}", node.key());
        }
    }
}

#[tokio::test]
async fn test_item_round_trip_in_exclusive_mode() {
    let view = Arc::new(ViewState::new().with_containers_shown([ContainerId::new(M1)]));
    view.set_always_shown_exclusive(true);
    let handler = handler_over(view.clone());

    let node = element(E3, C2);
    handler.set_visibility(&node, true).await.unwrap();
    assert_eq!(status(&handler, &node).await, VisibilityStatus::Visible);
    assert_eq!(status(&handler, &category(C1)).await, VisibilityStatus::Hidden);
    assert_eq!(status(&handler, &category(C2)).await, VisibilityStatus::Visible);

    handler.set_visibility(&node, false).await.unwrap();
    assert_eq!(status(&handler, &node).await, VisibilityStatus::Hidden);
    assert!(view.never_shown().is_empty());
}

#[tokio::test]
async fn test_container_aggregation_is_monotonic() {
    let cases = [
        (vec![C1, C2], VisibilityStatus::Visible),
        (vec![], VisibilityStatus::Hidden),
        (vec![C1], VisibilityStatus::Partial),
        (vec![C2], VisibilityStatus::Partial),
    ];
    for (selected, expected) in cases {
        let view = Arc::new(
            ViewState::new()
                .with_containers_shown([ContainerId::new(M1)])
                .with_category_selector_on(selected.iter().copied().map(CollectionId::new)),
        );
        let handler = handler_over(view);

        let children = [
            status(&handler, &category(C1)).await,
            status(&handler, &category(C2)).await,
        ];
        let distinct: HashSet<VisibilityStatus> = children.into_iter().collect();
        assert_eq!(status(&handler, &model()).await, expected, "selected {selected:?}");
        // Agreeing children decide the container; disagreement is partial.
        if distinct.len() == 1 {
            assert_eq!(distinct.into_iter().next(), Some(expected));
        } else {
            assert_eq!(expected, VisibilityStatus::Partial);
        }
    }
}

#[tokio::test]
async fn test_view_mode_mismatch_is_disabled() {
    let view = Arc::new(ViewState::new().with_containers_shown([ContainerId::new(M1)]));
    let handler = handler_over(view);

    let flat = HierarchyNode::container_with_dimension(M1, canopy::Dimension::TwoD);
    assert_eq!(status(&handler, &flat).await, VisibilityStatus::Disabled);
}

#[tokio::test]
async fn test_nested_container_shows_through_hidden_parent() {
    init_tracing();
    let dataset = Arc::new(
        MemoryDataset::new()
            .with_item(E1, M1, C1)
            .with_item(5, 200, 50)
            .with_sub_model(E1, 200),
    );
    let view = Arc::new(
        ViewState::new()
            .with_containers_shown([ContainerId::new(200)])
            .with_category_selector_on([CollectionId::new(50)]),
    );
    let handler = VisibilityHandler::new(dataset, view.clone(), EngineConfig::default()).unwrap();

    assert_eq!(status(&handler, &model()).await, VisibilityStatus::Partial);
    let root = element(E1, C1).with_sub_model(200);
    assert_eq!(status(&handler, &root).await, VisibilityStatus::Partial);

    handler.set_visibility(&model(), false).await.unwrap();
    assert!(!view.is_container_shown(ContainerId::new(200)));
    assert_eq!(status(&handler, &model()).await, VisibilityStatus::Hidden);
}

#[tokio::test]
async fn test_sub_model_root_merges_with_nested_container() {
    init_tracing();
    let dataset = Arc::new(
        MemoryDataset::new()
            .with_item(E1, M1, C1)
            .with_item(5, 200, 50)
            .with_sub_model(E1, 200),
    );
    let view = Arc::new(
        ViewState::new()
            .with_containers_shown([ContainerId::new(M1)])
            .with_category_selector_on([CollectionId::new(C1), CollectionId::new(50)]),
    );
    let handler = VisibilityHandler::new(dataset, view.clone(), EngineConfig::default()).unwrap();

    // The root item is displayed but its nested container is not.
    let root = element(E1, C1);
    assert_eq!(status(&handler, &root).await, VisibilityStatus::Partial);

    view.set_containers_shown(&[ContainerId::new(200)], true);
    assert_eq!(status(&handler, &root).await, VisibilityStatus::Visible);
}

#[tokio::test]
async fn test_empty_collection_is_ignored() {
    init_tracing();
    let dataset = Arc::new(
        MemoryDataset::new()
            .with_item(E1, M1, C1)
            .with_collection(M1, 30),
    );
    let view = Arc::new(ViewState::new().with_category_selector_on([CollectionId::new(C1)]));
    let handler = VisibilityHandler::new(dataset, view.clone(), EngineConfig::default()).unwrap();

    handler.set_visibility(&model(), true).await.unwrap();
    assert_eq!(
        view.category_override(ContainerId::new(M1), CollectionId::new(30)),
        CategoryOverride::None
    );
    assert_eq!(status(&handler, &model()).await, VisibilityStatus::Visible);
}

#[tokio::test]
async fn test_item_off_cascades_to_children() {
    init_tracing();
    let dataset = Arc::new(
        MemoryDataset::new()
            .with_item(E1, M1, C1)
            .with_item(E2, M1, C1)
            .with_item(E3, M1, C1)
            .with_parent(E2, E1)
            .with_parent(E3, E2),
    );
    let view = Arc::new(
        ViewState::new()
            .with_containers_shown([ContainerId::new(M1)])
            .with_category_selector_on([CollectionId::new(C1)]),
    );
    let handler = VisibilityHandler::new(dataset, view.clone(), EngineConfig::default()).unwrap();

    handler
        .set_visibility(&element(E1, C1), false)
        .await
        .unwrap();

    let expected: HashSet<ItemId> = [E1, E2, E3].into_iter().map(ItemId::new).collect();
    assert_eq!(view.never_shown(), expected);
    assert_eq!(status(&handler, &category(C1)).await, VisibilityStatus::Hidden);
}

#[tokio::test]
async fn test_query_failure_leaves_surface_untouched() {
    init_tracing();
    let dataset = dataset();
    let view = Arc::new(ViewState::new());
    let handler = VisibilityHandler::new(dataset.clone(), view.clone(), EngineConfig::default())
        .unwrap();
    let before = snapshot(&view);

    dataset.fail_next(
        "container-collections",
        canopy::QueryError::Aborted {
            token: "restart".into(),
        },
    );
    let result = handler.set_visibility(&category(C1), true).await;
    match result {
        Err(VisibilityError::Query(error)) => assert!(error.is_retryable()),
        other => panic!("expected a query error, got {other:?}"),
    }
    assert_eq!(snapshot(&view), before);

    // The failed fetch is not cached; a retry goes through.
    let outcome = handler.set_visibility(&category(C1), true).await.unwrap();
    assert!(matches!(outcome, MutationOutcome::Applied { .. }));
    assert_eq!(status(&handler, &category(C1)).await, VisibilityStatus::Visible);
    assert_eq!(dataset.query_count("container-collections"), 2);
}

#[tokio::test]
async fn test_resolve_failure_is_reported() {
    init_tracing();
    let dataset = dataset();
    let view = Arc::new(ViewState::new().with_containers_shown([ContainerId::new(M1)]));
    let handler = VisibilityHandler::new(dataset.clone(), view, EngineConfig::default()).unwrap();

    dataset.fail_next("container-collections", canopy::QueryError::Failed("offline".into()));
    assert!(matches!(
        handler.resolve(&model()).await,
        Err(VisibilityError::Query(_))
    ));
    assert_eq!(status(&handler, &model()).await, VisibilityStatus::Hidden);
}

#[tokio::test]
async fn test_external_surface_change_is_observed() {
    let view = Arc::new(ViewState::new().with_containers_shown([ContainerId::new(M1)]));
    let handler = handler_over(view.clone());
    assert_eq!(status(&handler, &category(C1)).await, VisibilityStatus::Hidden);

    view.set_category_selector(&[CollectionId::new(C1)], true);
    assert_eq!(status(&handler, &category(C1)).await, VisibilityStatus::Visible);
    assert_eq!(status(&handler, &model()).await, VisibilityStatus::Partial);
}
