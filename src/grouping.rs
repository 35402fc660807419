//! Clusters an ordered message list into visually stitched bubble groups.

use serde::{Deserialize, Serialize};

use crate::model::{Message, UserId};

/// Largest gap between consecutive grouped messages, in milliseconds.
pub const GROUPING_THRESHOLD_MS: u64 = 180_000;

/// Radius of an outer, free-standing bubble corner.
pub const FULL_RADIUS: f32 = 18.0;
/// Radius of a corner touching the next bubble of the same group.
pub const SEAM_RADIUS: f32 = 4.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BubblePosition {
    Single,
    Top,
    Middle,
    Bottom,
}

impl BubblePosition {
    pub fn for_index(index: usize, len: usize) -> Self {
        match (index, len) {
            (_, 0 | 1) => Self::Single,
            (0, _) => Self::Top,
            (i, n) if i + 1 >= n => Self::Bottom,
            _ => Self::Middle,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BubbleCorners {
    pub top_left: f32,
    pub top_right: f32,
    pub bottom_left: f32,
    pub bottom_right: f32,
}

impl BubbleCorners {
    pub const ROUND: Self = Self {
        top_left: FULL_RADIUS,
        top_right: FULL_RADIUS,
        bottom_left: FULL_RADIUS,
        bottom_right: FULL_RADIUS,
    };
}

/// Seams sit on the sender's side: right for outgoing, left for incoming.
pub fn bubble_corners(position: BubblePosition, direction: Direction) -> BubbleCorners {
    let (seam_above, seam_below) = match position {
        BubblePosition::Single => (false, false),
        BubblePosition::Top => (false, true),
        BubblePosition::Middle => (true, true),
        BubblePosition::Bottom => (true, false),
    };
    let radius = |seam: bool| if seam { SEAM_RADIUS } else { FULL_RADIUS };

    match direction {
        Direction::Outgoing => BubbleCorners {
            top_right: radius(seam_above),
            bottom_right: radius(seam_below),
            ..BubbleCorners::ROUND
        },
        Direction::Incoming => BubbleCorners {
            top_left: radius(seam_above),
            bottom_left: radius(seam_below),
            ..BubbleCorners::ROUND
        },
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MessageGroup {
    pub messages: Vec<Message>,
    pub direction: Direction,
    pub sender_id: UserId,
    pub sender_name: String,
    pub sender_avatar: Option<String>,
}

impl MessageGroup {
    fn start(message: Message, sender_id: UserId, current_user: &UserId) -> Self {
        let direction = if &sender_id == current_user {
            Direction::Outgoing
        } else {
            Direction::Incoming
        };
        Self {
            direction,
            sender_id,
            sender_name: message.sender_name.clone(),
            sender_avatar: message.sender_avatar.clone(),
            messages: vec![message],
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn position_of(&self, index: usize) -> BubblePosition {
        BubblePosition::for_index(index, self.messages.len())
    }

    /// Each message with its position and corner radii, top to bottom.
    pub fn bubbles(&self) -> impl Iterator<Item = (&Message, BubblePosition, BubbleCorners)> {
        let len = self.messages.len();
        let direction = self.direction;
        self.messages.iter().enumerate().map(move |(i, m)| {
            let position = BubblePosition::for_index(i, len);
            (m, position, bubble_corners(position, direction))
        })
    }

    /// Untimed messages never split a run, but a timed one is measured
    /// against the newest timed member, not just the last message.
    fn accepts(&self, sender_id: &UserId, message: &Message) -> bool {
        if &self.sender_id != sender_id {
            return false;
        }
        let previous = self.messages.iter().rev().find_map(|m| m.created_at);
        match (previous, message.created_at) {
            (Some(prev), Some(next)) => prev.abs_diff(next) <= GROUPING_THRESHOLD_MS,
            _ => true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GroupItem {
    Group(MessageGroup),
    System(Message),
}

/// Groups `messages` in the order given. System messages close the open group
/// and are emitted on their own.
pub fn group(messages: &[Message], current_user: &UserId) -> Vec<GroupItem> {
    let mut items = Vec::new();
    let mut open: Option<MessageGroup> = None;

    for message in messages {
        let Some(sender_id) = message.sender_id.clone() else {
            items.extend(open.take().map(GroupItem::Group));
            items.push(GroupItem::System(message.clone()));
            continue;
        };

        match open.as_mut() {
            Some(current) if current.accepts(&sender_id, message) => {
                current.messages.push(message.clone());
            }
            _ => {
                items.extend(open.take().map(GroupItem::Group));
                open = Some(MessageGroup::start(message.clone(), sender_id, current_user));
            }
        }
    }

    items.extend(open.map(GroupItem::Group));
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MessageId, UnixTimeMs};
    use proptest::prelude::*;

    fn me() -> UserId {
        UserId::new("me")
    }

    fn msg(id: &str, sender: Option<&str>, secs: Option<u64>) -> Message {
        Message::new(
            MessageId::new(id),
            sender.map(UserId::new),
            sender.unwrap_or("system"),
            secs.map(UnixTimeMs::from_secs),
        )
    }

    fn groups(items: &[GroupItem]) -> Vec<&MessageGroup> {
        items
            .iter()
            .filter_map(|item| match item {
                GroupItem::Group(g) => Some(g),
                GroupItem::System(_) => None,
            })
            .collect()
    }

    #[test]
    fn empty_input_yields_nothing() {
        assert!(group(&[], &me()).is_empty());
    }

    #[test]
    fn single_message_is_single_position() {
        let items = group(&[msg("a", Some("alice"), Some(0))], &me());
        assert_eq!(items.len(), 1);
        let g = groups(&items)[0];
        assert_eq!(g.len(), 1);
        assert_eq!(g.position_of(0), BubblePosition::Single);
        assert_eq!(g.direction, Direction::Incoming);
    }

    #[test]
    fn short_gap_groups_long_gap_splits() {
        let close = [msg("a", Some("alice"), Some(0)), msg("b", Some("alice"), Some(10))];
        assert_eq!(group(&close, &me()).len(), 1);

        let far = [msg("a", Some("alice"), Some(0)), msg("b", Some("alice"), Some(200))];
        assert_eq!(group(&far, &me()).len(), 2);
    }

    #[test]
    fn gap_exactly_at_threshold_still_groups() {
        let items = group(
            &[msg("a", Some("alice"), Some(0)), msg("b", Some("alice"), Some(180))],
            &me(),
        );
        assert_eq!(items.len(), 1);
    }

    #[test]
    fn system_message_splits_same_sender_run() {
        let items = group(
            &[
                msg("a", Some("alice"), Some(0)),
                msg("sys", None, Some(1)),
                msg("b", Some("alice"), Some(2)),
            ],
            &me(),
        );
        assert_eq!(items.len(), 3);
        assert!(matches!(items[0], GroupItem::Group(_)));
        assert!(matches!(&items[1], GroupItem::System(m) if m.id.as_str() == "sys"));
        assert!(matches!(items[2], GroupItem::Group(_)));
    }

    #[test]
    fn sender_change_starts_new_group() {
        let items = group(
            &[
                msg("a", Some("alice"), Some(0)),
                msg("b", Some("me"), Some(1)),
                msg("c", Some("alice"), Some(2)),
            ],
            &me(),
        );
        let gs = groups(&items);
        assert_eq!(gs.len(), 3);
        assert_eq!(gs[1].direction, Direction::Outgoing);
    }

    #[test]
    fn missing_timestamps_continue_same_sender() {
        let items = group(
            &[
                msg("a", Some("alice"), Some(0)),
                msg("b", Some("alice"), None),
                msg("c", Some("alice"), Some(100)),
            ],
            &me(),
        );
        assert_eq!(items.len(), 1);
        assert_eq!(groups(&items)[0].len(), 3);
    }

    #[test]
    fn untimed_message_does_not_bridge_a_long_gap() {
        let items = group(
            &[
                msg("a", Some("alice"), Some(0)),
                msg("b", Some("alice"), None),
                msg("c", Some("alice"), Some(10_000)),
            ],
            &me(),
        );
        let gs = groups(&items);
        assert_eq!(gs.len(), 2);
        assert_eq!(gs[0].len(), 2);
        assert_eq!(gs[1].messages[0].id, MessageId::new("c"));
    }

    #[test]
    fn out_of_order_gap_uses_absolute_difference() {
        let items = group(
            &[msg("a", Some("alice"), Some(500)), msg("b", Some("alice"), Some(100))],
            &me(),
        );
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn positions_run_top_middle_bottom() {
        let items = group(
            &[
                msg("a", Some("me"), Some(0)),
                msg("b", Some("me"), Some(1)),
                msg("c", Some("me"), Some(2)),
                msg("d", Some("me"), Some(3)),
            ],
            &me(),
        );
        let positions: Vec<_> = groups(&items)[0].bubbles().map(|(_, p, _)| p).collect();
        assert_eq!(
            positions,
            vec![
                BubblePosition::Top,
                BubblePosition::Middle,
                BubblePosition::Middle,
                BubblePosition::Bottom
            ]
        );
    }

    #[test]
    fn group_carries_sender_avatar() {
        let first = msg("a", Some("alice"), Some(0)).with_avatar("https://cdn.example.com/a.png");
        let items = group(&[first], &me());
        assert_eq!(
            groups(&items)[0].sender_avatar.as_deref(),
            Some("https://cdn.example.com/a.png")
        );
    }

    #[test]
    fn outgoing_seams_on_right() {
        let top = bubble_corners(BubblePosition::Top, Direction::Outgoing);
        assert_eq!(top.bottom_right, SEAM_RADIUS);
        assert_eq!(top.top_right, FULL_RADIUS);
        assert_eq!(top.bottom_left, FULL_RADIUS);

        let middle = bubble_corners(BubblePosition::Middle, Direction::Outgoing);
        assert_eq!((middle.top_right, middle.bottom_right), (SEAM_RADIUS, SEAM_RADIUS));
        assert_eq!((middle.top_left, middle.bottom_left), (FULL_RADIUS, FULL_RADIUS));

        let bottom = bubble_corners(BubblePosition::Bottom, Direction::Outgoing);
        assert_eq!(bottom.top_right, SEAM_RADIUS);
        assert_eq!(bottom.bottom_right, FULL_RADIUS);
    }

    #[test]
    fn incoming_mirrors_outgoing() {
        for position in [
            BubblePosition::Single,
            BubblePosition::Top,
            BubblePosition::Middle,
            BubblePosition::Bottom,
        ] {
            let out = bubble_corners(position, Direction::Outgoing);
            let inc = bubble_corners(position, Direction::Incoming);
            assert_eq!(out.top_right, inc.top_left);
            assert_eq!(out.bottom_right, inc.bottom_left);
            assert_eq!(out.top_left, inc.top_right);
        }
        assert_eq!(
            bubble_corners(BubblePosition::Single, Direction::Incoming),
            BubbleCorners::ROUND
        );
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        (
            prop::option::weighted(0.9, prop::sample::select(vec!["me", "alice", "bob"])),
            prop::option::weighted(0.8, 0u64..2_000),
        )
            .prop_map(|(sender, secs)| msg("m", sender, secs))
    }

    proptest! {
        #[test]
        fn grouping_preserves_every_message_in_order(
            messages in prop::collection::vec(arb_message(), 0..40)
        ) {
            let items = group(&messages, &me());
            let flattened: Vec<&Message> = items
                .iter()
                .flat_map(|item| match item {
                    GroupItem::Group(g) => g.messages.iter().collect::<Vec<_>>(),
                    GroupItem::System(m) => vec![m],
                })
                .collect();
            prop_assert_eq!(flattened.len(), messages.len());
            for (a, b) in flattened.iter().zip(messages.iter()) {
                prop_assert_eq!(*a, b);
            }
        }

        #[test]
        fn groups_are_single_sender_and_non_empty(
            messages in prop::collection::vec(arb_message(), 0..40)
        ) {
            for item in group(&messages, &me()) {
                if let GroupItem::Group(g) = item {
                    prop_assert!(!g.is_empty());
                    prop_assert!(g.messages.iter().all(|m| m.is_from(&g.sender_id)));
                }
            }
        }

        #[test]
        fn consecutive_timed_members_stay_within_threshold(
            messages in prop::collection::vec(arb_message(), 0..40)
        ) {
            for item in group(&messages, &me()) {
                if let GroupItem::Group(g) = item {
                    let times: Vec<UnixTimeMs> =
                        g.messages.iter().filter_map(|m| m.created_at).collect();
                    for pair in times.windows(2) {
                        prop_assert!(pair[0].abs_diff(pair[1]) <= GROUPING_THRESHOLD_MS);
                    }
                }
            }
        }
    }
}
