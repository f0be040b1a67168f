//! Linear-id to event-id translation.
//!
//! The external tool addresses events by a linear id it assigns while
//! walking the capture; the capture itself keys everything by event id. The
//! map is rebuilt once per capture load and cleared on close.

use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ReverseEntry {
    linear_id: u32,
    display_name: String,
}

#[derive(Debug, Default)]
pub struct EventMap {
    /// Dense: index is the linear id.
    linear_to_event: Vec<u64>,
    by_event: HashMap<u64, ReverseEntry>,
}

impl EventMap {
    pub fn new() -> EventMap {
        EventMap::default()
    }

    /// Replaces the whole mapping from the capture's event walk. Linear ids
    /// are assigned in iteration order, starting at 0.
    pub fn rebuild<I>(&mut self, events: I)
    where
        I: IntoIterator<Item = (u64, String)>,
    {
        self.linear_to_event.clear();
        self.by_event.clear();
        for (linear_id, (event_id, display_name)) in events.into_iter().enumerate() {
            self.linear_to_event.push(event_id);
            self.by_event.insert(
                event_id,
                ReverseEntry {
                    linear_id: linear_id as u32,
                    display_name,
                },
            );
        }
    }

    pub fn clear(&mut self) {
        self.linear_to_event.clear();
        self.by_event.clear();
    }

    pub fn event_for_linear(&self, linear_id: u32) -> Option<u64> {
        self.linear_to_event.get(linear_id as usize).copied()
    }

    pub fn linear_for_event(&self, event_id: u64) -> Option<u32> {
        self.by_event.get(&event_id).map(|e| e.linear_id)
    }

    pub fn display_name(&self, event_id: u64) -> Option<&str> {
        self.by_event.get(&event_id).map(|e| e.display_name.as_str())
    }

    pub fn len(&self) -> usize {
        self.linear_to_event.len()
    }

    pub fn is_empty(&self) -> bool {
        self.linear_to_event.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> EventMap {
        let mut map = EventMap::new();
        map.rebuild([
            (100, "Clear".to_owned()),
            (250, "Draw".to_owned()),
            (251, "Dispatch".to_owned()),
        ]);
        map
    }

    #[test]
    fn linear_ids_follow_walk_order() {
        let map = sample();
        assert_eq!(map.event_for_linear(0), Some(100));
        assert_eq!(map.event_for_linear(2), Some(251));
        assert_eq!(map.event_for_linear(3), None);
        assert_eq!(map.linear_for_event(250), Some(1));
        assert_eq!(map.display_name(250), Some("Draw"));
    }

    #[test]
    fn rebuild_replaces_previous_capture() {
        let mut map = sample();
        map.rebuild([(9, "Present".to_owned())]);
        assert_eq!(map.len(), 1);
        assert_eq!(map.event_for_linear(0), Some(9));
        assert_eq!(map.linear_for_event(100), None);
    }

    #[test]
    fn clear_empties_both_directions() {
        let mut map = sample();
        map.clear();
        assert!(map.is_empty());
        assert_eq!(map.event_for_linear(0), None);
        assert_eq!(map.linear_for_event(100), None);
    }
}
