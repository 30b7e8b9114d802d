use super::*;
use crate::tests::{at, category, item, revised};

fn loaded(items: Vec<Item>) -> Projection {
    let mut projection = Projection::loading(category(1, "Juan 3"));
    projection.load(items);
    projection
}

fn ids(projection: &Projection) -> Vec<i64> {
    projection.items.iter().map(|item| item.id.0).collect()
}

#[test]
fn empty_projection_is_settled_and_consistent() {
    let projection = Projection::empty();
    assert!(projection.settled);
    assert!(!projection.live);
    assert!(projection.is_empty());
    assert!(projection.is_consistent());
    assert_eq!(projection.category_id(), None);
}

#[test]
fn load_orders_by_creation_time_then_id() {
    let mut tied = item(7, 1, false);
    tied.created_at = at(2);
    let projection = loaded(vec![item(3, 1, false), tied, item(2, 1, false), item(1, 1, false)]);

    assert_eq!(ids(&projection), vec![1, 2, 7, 3]);
    assert_eq!(projection.active_index, None);
}

#[test]
fn load_drops_rows_of_other_categories_and_keeps_newest_duplicate() {
    let first = item(1, 1, false);
    let newer = revised(&first, 3, false, 30);
    let projection = loaded(vec![first, item(2, 9, false), newer.clone()]);

    assert_eq!(ids(&projection), vec![1]);
    assert_eq!(projection.items[0].revision, 3);
}

#[test]
fn load_keeps_the_most_recent_active_claim() {
    let one = revised(&item(1, 1, false), 2, true, 50);
    let three = revised(&item(3, 1, false), 2, true, 90);
    let projection = loaded(vec![one, item(2, 1, false), three]);

    assert_eq!(projection.active_index, Some(2));
    assert_eq!(projection.active_item().map(|item| item.id), Some(ItemId(3)));
    assert!(projection.is_consistent());
}

#[test]
fn applying_the_same_event_twice_equals_applying_it_once() {
    let mut projection = loaded(vec![item(1, 1, true), item(2, 1, false)]);
    let event = ChangeEvent::updated(revised(&item(2, 1, false), 2, true, 60));

    assert!(projection.apply_change(&event).is_applied());
    let once = projection.clone();
    assert_eq!(
        projection.apply_change(&event),
        ChangeOutcome::Ignored(IgnoreReason::Stale)
    );

    assert_eq!(projection.items, once.items);
    assert_eq!(projection.active_index, once.active_index);
    assert_eq!(projection.active_index, Some(1));
    assert!(projection.is_consistent());
}

#[test]
fn older_revision_is_ignored() {
    let current = revised(&item(1, 1, false), 4, true, 40);
    let mut projection = loaded(vec![current.clone(), item(2, 1, false)]);

    let late = ChangeEvent::updated(revised(&current, 3, false, 30));
    assert_eq!(
        projection.apply_change(&late),
        ChangeOutcome::Ignored(IgnoreReason::Stale)
    );
    assert_eq!(projection.active_index, Some(0));
}

#[test]
fn insert_preserves_creation_order() {
    let mut projection = loaded(vec![item(1, 1, true), item(3, 1, false)]);
    let outcome = projection.apply_change(&ChangeEvent::inserted(item(2, 1, false)));

    assert!(outcome.is_applied());
    assert_eq!(ids(&projection), vec![1, 2, 3]);
    assert_eq!(projection.active_index, Some(0));
}

#[test]
fn newer_active_claim_displaces_the_current_active_item() {
    let mut projection = loaded(vec![item(1, 1, true), item(2, 1, false), item(3, 1, false)]);

    let claim = ChangeEvent::updated(revised(&item(3, 1, false), 2, true, 70));
    assert!(projection.apply_change(&claim).is_applied());

    assert_eq!(projection.active_index, Some(2));
    assert!(!projection.items[0].active);
    assert!(projection.is_consistent());
}

#[test]
fn older_active_claim_loses_to_the_current_active_item() {
    let three = revised(&item(3, 1, false), 2, true, 80);
    let mut projection = loaded(vec![item(1, 1, false), item(2, 1, false), three]);

    let late_claim = ChangeEvent::updated(revised(&item(2, 1, false), 2, true, 40));
    assert!(projection.apply_change(&late_claim).is_applied());

    assert_eq!(projection.active_index, Some(2));
    assert_eq!(projection.items[1].revision, 2);
    assert!(!projection.items[1].active);
    assert!(projection.is_consistent());
}

#[test]
fn deactivating_the_active_item_unsettles_a_non_empty_projection() {
    let mut projection = loaded(vec![item(1, 1, true), item(2, 1, false)]);
    projection.recompute_settled(0);
    assert!(projection.settled);

    let off = ChangeEvent::updated(revised(&item(1, 1, true), 2, false, 20));
    assert!(projection.apply_change(&off).is_applied());
    projection.recompute_settled(0);

    assert_eq!(projection.active_index, None);
    assert!(!projection.settled);
    assert!(projection.is_consistent());
}

#[test]
fn deleting_the_active_item_clears_it_and_tombstones_the_id() {
    let mut projection = loaded(vec![item(1, 1, false), item(2, 1, true), item(3, 1, false)]);

    let delete = ChangeEvent::deleted(item(2, 1, true));
    assert!(projection.apply_change(&delete).is_applied());
    assert_eq!(ids(&projection), vec![1, 3]);
    assert_eq!(projection.active_index, None);

    assert_eq!(
        projection.apply_change(&delete),
        ChangeOutcome::Ignored(IgnoreReason::Deleted)
    );
    let resurrect = ChangeEvent::updated(revised(&item(2, 1, false), 9, true, 99));
    assert_eq!(
        projection.apply_change(&resurrect),
        ChangeOutcome::Ignored(IgnoreReason::Deleted)
    );
    assert_eq!(ids(&projection), vec![1, 3]);
}

#[test]
fn deleting_another_item_keeps_the_active_item() {
    let mut projection = loaded(vec![item(1, 1, false), item(2, 1, false), item(3, 1, true)]);

    assert!(projection
        .apply_change(&ChangeEvent::deleted(item(1, 1, false)))
        .is_applied());
    assert_eq!(projection.active_index, Some(1));
    assert_eq!(projection.active_item().map(|item| item.id), Some(ItemId(3)));
}

#[test]
fn events_without_a_matching_category_are_ignored() {
    let mut empty = Projection::empty();
    assert_eq!(
        empty.apply_change(&ChangeEvent::inserted(item(1, 1, false))),
        ChangeOutcome::Ignored(IgnoreReason::NoCategory)
    );

    let mut projection = loaded(vec![item(1, 1, true)]);
    assert_eq!(
        projection.apply_change(&ChangeEvent::inserted(item(5, 2, true))),
        ChangeOutcome::Ignored(IgnoreReason::ForeignCategory)
    );
    let rowless = ChangeEvent {
        event_type: ChangeKind::Update,
        new: None,
        old: None,
    };
    assert_eq!(
        projection.apply_change(&rowless),
        ChangeOutcome::Ignored(IgnoreReason::MissingRow)
    );
    assert_eq!(ids(&projection), vec![1]);
}

#[test]
fn mark_active_local_rejects_unknown_items() {
    let mut projection = loaded(vec![item(1, 1, true), item(2, 1, false)]);

    assert!(!projection.mark_active_local(ItemId(42)));
    assert_eq!(projection.active_index, Some(0));

    assert!(projection.mark_active_local(ItemId(2)));
    assert_eq!(projection.active_index, Some(1));
    assert!(projection.is_consistent());
}

#[test]
fn single_active_holds_across_a_mixed_event_sequence() {
    let mut projection = loaded(vec![item(1, 1, false), item(2, 1, false), item(3, 1, false)]);
    let events = vec![
        ChangeEvent::updated(revised(&item(1, 1, false), 2, true, 10)),
        ChangeEvent::updated(revised(&item(2, 1, false), 2, true, 12)),
        ChangeEvent::updated(revised(&item(1, 1, false), 3, false, 11)),
        ChangeEvent::inserted(revised(&item(4, 1, false), 1, true, 14)),
        ChangeEvent::updated(revised(&item(3, 1, false), 2, true, 13)),
        ChangeEvent::deleted(item(2, 1, false)),
        ChangeEvent::updated(revised(&item(2, 1, false), 3, true, 20)),
        ChangeEvent::updated(revised(&item(4, 1, false), 2, false, 15)),
    ];

    for event in &events {
        projection.apply_change(event);
        assert!(projection.is_consistent(), "inconsistent after {event:?}");
    }
    assert_eq!(ids(&projection), vec![1, 3, 4]);
    assert_eq!(projection.active_index, None);
}
