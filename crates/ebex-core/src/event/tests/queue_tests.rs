use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::event::queue::{Prioritized, PriorityQueue, QueueEntry};
use crate::event::types::{EventData, EventName, HandlerId, Priority};

#[derive(Debug, Clone, PartialEq)]
struct Item {
    name: &'static str,
    priority: Priority,
}

impl Prioritized for Item {
    fn priority(&self) -> Priority {
        self.priority
    }
}

fn item(name: &'static str, priority: i64) -> Item {
    Item { name, priority: Priority::new(priority) }
}

fn pop_name(queue: &mut PriorityQueue<Item>) -> Option<&'static str> {
    queue.pop().map(|item| item.name)
}

#[test]
fn test_push_increases_length() {
    let mut queue = PriorityQueue::new();
    queue.push(item("test", 5));
    assert_eq!(queue.len(), 1);
    assert!(!queue.is_empty());
}

#[test]
fn test_pop_returns_highest_priority() {
    let mut queue = PriorityQueue::new();
    queue.push(item("test1", 5));
    queue.push(item("test2", 10));
    assert_eq!(pop_name(&mut queue), Some("test2"));
}

#[test]
fn test_pop_order_for_mixed_priorities() {
    let mut queue = PriorityQueue::new();
    queue.push(item("test1", 5));
    queue.push(item("test2", 10));
    queue.push(item("test3", 1));

    assert_eq!(pop_name(&mut queue), Some("test2"));
    assert_eq!(pop_name(&mut queue), Some("test1"));
    assert_eq!(pop_name(&mut queue), Some("test3"));
    assert_eq!(pop_name(&mut queue), None);
}

#[test]
fn test_children_with_lower_priority_stay_below_parent() {
    let mut queue = PriorityQueue::new();
    queue.push(item("parent", 5));
    queue.push(item("child1", 3));
    queue.push(item("child2", 4));

    assert_eq!(pop_name(&mut queue), Some("parent"));
    assert_eq!(pop_name(&mut queue), Some("child2"));
    assert_eq!(pop_name(&mut queue), Some("child1"));
}

#[test]
fn test_pop_empty_queue() {
    let mut queue: PriorityQueue<Item> = PriorityQueue::new();
    assert!(queue.pop().is_none());
    assert!(queue.peek().is_none());
}

#[test]
fn test_single_item_round_trip() {
    let mut queue = PriorityQueue::new();
    let only = item("only", 5);
    queue.push(only.clone());

    assert_eq!(queue.pop(), Some(only));
    assert_eq!(queue.len(), 0);
}

#[test]
fn test_reorders_after_popping_root() {
    let mut queue = PriorityQueue::new();
    queue.push(item("first", 10));
    queue.push(item("second", 5));
    queue.push(item("third", 8));

    assert_eq!(pop_name(&mut queue), Some("first"));
    assert_eq!(queue.len(), 2);
    assert_eq!(pop_name(&mut queue), Some("third"));
    assert_eq!(queue.len(), 1);
}

#[test]
fn test_sift_down_promotes_right_child() {
    let mut queue = PriorityQueue::new();
    queue.push(item("highest", 100));
    queue.push(item("low", 1));
    queue.push(item("mid", 5));
    queue.push(item("high", 10));

    queue.pop();
    assert_eq!(pop_name(&mut queue), Some("high"));
    assert_eq!(queue.peek().map(|item| item.name), Some("mid"));
}

#[test]
fn test_clear_discards_everything() {
    let mut queue = PriorityQueue::new();
    queue.push(item("to-clear", 1));
    queue.push(item("to-clear-too", 2));
    queue.clear();

    assert_eq!(queue.len(), 0);
    assert!(queue.pop().is_none());
}

#[test]
fn test_negative_and_extreme_priorities() {
    let mut queue = PriorityQueue::new();
    queue.push(item("zero", 0));
    queue.push(item("min", i64::MIN));
    queue.push(item("max", i64::MAX));
    queue.push(item("negative", -7));

    assert_eq!(pop_name(&mut queue), Some("max"));
    assert_eq!(pop_name(&mut queue), Some("zero"));
    assert_eq!(pop_name(&mut queue), Some("negative"));
    assert_eq!(pop_name(&mut queue), Some("min"));
}

#[test]
fn test_pops_are_non_increasing_for_random_pushes() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut queue = PriorityQueue::new();

    for _ in 0..500 {
        queue.push(item("random", rng.gen_range(-50..50)));
        // Interleave a few pops so sift-down runs against partial heaps too.
        if rng.gen_bool(0.2) {
            queue.pop();
        }
    }

    let mut previous = Priority::MAX;
    while let Some(next) = queue.pop() {
        assert!(next.priority <= previous, "{} came after {}", next.priority, previous);
        previous = next.priority;
    }
}

#[test]
fn test_queue_entry_orders_by_handler_priority() {
    let event = EventName::parse("orders").unwrap();
    let data = EventData::new();
    let mut queue = PriorityQueue::new();

    for priority in [3, 9, 1] {
        queue.push(QueueEntry {
            event: event.clone(),
            data: data.clone(),
            handler_id: HandlerId::next(),
            priority: Priority::new(priority),
            need_await: false,
        });
    }

    let popped: Vec<i64> = std::iter::from_fn(|| queue.pop()).map(|e| e.priority.value()).collect();
    assert_eq!(popped, vec![9, 3, 1]);
}
