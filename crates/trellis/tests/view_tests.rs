//! Tests that keep a derived view consistent with its parent.

use serde_json::{json, Value};

use trellis::prelude::*;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn accepted(model: &Model) -> bool {
    model
        .get("score")
        .and_then(|s| s.as_i64())
        .is_some_and(|s| s >= 50)
}

fn cids(models: &[Model]) -> Vec<String> {
    models.iter().map(|m| m.cid().to_string()).collect()
}

/// The view must equal the parent filtered, then sorted if it has a comparator.
fn assert_consistent(parent: &Collection, view: &VirtualCollection) {
    let mut expected: Vec<Model> = parent.models().into_iter().filter(accepted).collect();
    if let Some(comparator) = view.comparator() {
        comparator.sort(&mut expected);
        assert!(comparator.is_sorted(&view.models()));
        let mut actual = cids(&view.models());
        let mut wanted = cids(&expected);
        actual.sort();
        wanted.sort();
        assert_eq!(actual, wanted);
    } else {
        assert_eq!(cids(&view.models()), cids(&expected));
    }
}

fn scored(id: i64, score: i64) -> Value {
    json!({"id": id, "score": score})
}

fn mutate_and_check(parent: &Collection, view: &VirtualCollection) {
    init_tracing();
    assert_consistent(parent, view);

    parent.add(vec![scored(1, 80), scored(2, 10), scored(3, 55)], UpdateOptions::add());
    assert_consistent(parent, view);

    parent.add(vec![scored(4, 90)], UpdateOptions::add().with_at(0));
    assert_consistent(parent, view);

    parent.get(2).unwrap().set(("score", 99));
    assert_consistent(parent, view);

    parent.get(1).unwrap().set(("score", 5));
    assert_consistent(parent, view);

    parent.get(3).unwrap().set(("score", 60));
    assert_consistent(parent, view);

    parent.remove([4], UpdateOptions::set());
    assert_consistent(parent, view);

    parent.set(vec![scored(2, 70), scored(5, 50), scored(6, 0)], UpdateOptions::set());
    assert_consistent(parent, view);

    parent.get(5).unwrap().destroy();
    assert_consistent(parent, view);

    parent.reset(vec![scored(7, 51), scored(8, 49), scored(9, 100)], UpdateOptions::set());
    assert_consistent(parent, view);

    parent.set_comparator(Some(Comparator::attribute("score")));
    parent.sort();
    assert_consistent(parent, view);

    parent.add(vec![scored(10, 75)], UpdateOptions::add());
    assert_consistent(parent, view);
}

#[test]
fn test_consistency_in_parent_order() {
    let parent = Collection::new();
    let view = VirtualCollection::builder(&parent)
        .filter(Filter::predicate(|m, _| accepted(m)))
        .build();
    mutate_and_check(&parent, &view);
}

#[test]
fn test_consistency_with_own_comparator() {
    let parent = Collection::new();
    let view = VirtualCollection::builder(&parent)
        .filter(Filter::predicate(|m, _| accepted(m)))
        .comparator(Comparator::compare(|a, b| {
            trellis::collection::compare_values(
                &b.get("score").unwrap_or_default(),
                &a.get("score").unwrap_or_default(),
            )
        }))
        .build();
    mutate_and_check(&parent, &view);
}

#[test]
fn test_sorted_invariant_in_view() {
    let parent = Collection::new();
    let comparator = Comparator::attribute("score");
    let view = VirtualCollection::builder(&parent)
        .comparator(comparator.clone())
        .build();

    for (id, score) in [(1, 4), (2, 1), (3, 4), (4, 0), (5, 9), (6, 2)] {
        parent.add(vec![scored(id, score)], UpdateOptions::add());
        let models = view.models();
        for x in 0..models.len() {
            for y in x + 1..models.len() {
                assert_ne!(
                    comparator.ordering(&models[x], &models[y]),
                    std::cmp::Ordering::Greater
                );
            }
        }
    }
}

#[test]
fn test_views_over_the_same_parent_are_independent() {
    let parent = Collection::with_models(vec![scored(1, 10), scored(2, 90)]);
    let high = VirtualCollection::builder(&parent)
        .filter(Filter::predicate(|m, _| accepted(m)))
        .build();
    let all = VirtualCollection::new(&parent);

    parent.get(1).unwrap().set(("score", 95));

    assert_eq!(high.len(), 2);
    assert_eq!(all.len(), 2);
    drop(high);
    parent.add(vec![scored(3, 1)], UpdateOptions::add());
    assert_eq!(all.len(), 3);
}
