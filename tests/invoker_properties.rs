//! Property-based tests for the invoker using proptest.

use batcher::invoker::{AddOptions, Function, Groups, InvokeOptions, Invoker};
use proptest::prelude::*;
use serde_json::Value;
use std::cell::RefCell;
use std::rc::Rc;

// ============================================================================
// Test helpers
// ============================================================================

type Log = Rc<RefCell<Vec<usize>>>;

/// A command that appends `tag` to the log.
fn tagged(log: &Log, tag: usize) -> Function {
    let log = log.clone();
    Function::new(move |_, _| {
        log.borrow_mut().push(tag);
        Ok(Value::Null.into())
    })
}

fn invoke_default(invoker: &Invoker) {
    invoker.invoke(InvokeOptions::groups(Groups::Default)).unwrap();
}

/// Where `reorder` puts an item in a list it was taken out of.
fn model_reorder_index(len: usize, position: isize) -> usize {
    if position < 0 {
        (len as isize + position + 1).max(0) as usize
    } else {
        (position as usize).min(len)
    }
}

/// Where `add` with a position inserts into a list.
fn model_insert_index(len: usize, position: isize) -> usize {
    if position < 0 {
        (len as isize + position).max(0) as usize
    } else {
        (position as usize).min(len)
    }
}

// ============================================================================
// Property tests
// ============================================================================

proptest! {
    /// IDs increase strictly across adds, whichever invoker gets them.
    #[test]
    fn ids_strictly_increase_across_invokers(targets in prop::collection::vec(0usize..3, 1..40)) {
        let invokers = [Invoker::new(), Invoker::new(), Invoker::new()];
        let ids: Vec<u64> = targets
            .iter()
            .map(|&i| invokers[i].add(Function::new(|_, _| Ok(Value::Null.into())), AddOptions::default()).unwrap())
            .collect();
        prop_assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    /// IDs are not reused after removal.
    #[test]
    fn removed_ids_are_not_reused(count in 1usize..20) {
        let invoker = Invoker::new();
        let mut seen = Vec::new();
        for _ in 0..count {
            let id = invoker.add(Function::new(|_, _| Ok(Value::Null.into())), AddOptions::default()).unwrap();
            prop_assert!(!seen.contains(&id));
            seen.push(id);
            invoker.remove(id, Groups::Default, false).unwrap();
        }
    }

    /// Commands run in the order given by positional adds.
    #[test]
    fn positional_adds_follow_list_insert(positions in prop::collection::vec(prop::option::of(-6isize..6), 1..12)) {
        let log: Log = Rc::default();
        let invoker = Invoker::new();
        let mut model: Vec<usize> = Vec::new();

        for (tag, position) in positions.into_iter().enumerate() {
            let mut options = AddOptions::default();
            if let Some(pos) = position {
                options = options.at(pos);
                model.insert(model_insert_index(model.len(), pos), tag);
            } else {
                model.push(tag);
            }
            invoker.add(tagged(&log, tag), options).unwrap();
        }

        invoke_default(&invoker);
        prop_assert_eq!(log.borrow().clone(), model);
    }

    /// Reordering moves exactly one command; the others keep their order.
    #[test]
    fn reorder_matches_model(
        count in 1usize..10,
        moves in prop::collection::vec((0usize..10, -12isize..12), 0..10),
    ) {
        let log: Log = Rc::default();
        let invoker = Invoker::new();
        let ids: Vec<u64> = (0..count)
            .map(|tag| invoker.add(tagged(&log, tag), AddOptions::default()).unwrap())
            .collect();
        let mut model: Vec<usize> = (0..count).collect();

        for (which, position) in moves {
            let tag = which % count;
            invoker.reorder(ids[tag], position, None).unwrap();
            model.retain(|&t| t != tag);
            model.insert(model_reorder_index(model.len(), position), tag);
        }

        invoke_default(&invoker);
        prop_assert_eq!(log.borrow().clone(), model.clone());
        for (index, &tag) in model.iter().enumerate() {
            prop_assert_eq!(invoker.get_position(ids[tag], None).unwrap(), index);
        }
    }

    /// Removed commands no longer run; the rest keep their order.
    #[test]
    fn remove_keeps_relative_order(count in 1usize..10, removed in prop::collection::vec(any::<bool>(), 10)) {
        let log: Log = Rc::default();
        let invoker = Invoker::new();
        let ids: Vec<u64> = (0..count)
            .map(|tag| invoker.add(tagged(&log, tag), AddOptions::default()).unwrap())
            .collect();

        for tag in 0..count {
            if removed[tag] {
                invoker.remove(ids[tag], Groups::Default, false).unwrap();
            }
        }

        let expected: Vec<usize> = (0..count).filter(|&t| !removed[t]).collect();
        // a group emptied by removal is kept, so invoking it is not an error
        invoke_default(&invoker);
        prop_assert_eq!(log.borrow().clone(), expected);
    }
}
