//! Gesture state machine: `Idle -> Dragging -> DraggingOverTarget -> Idle`.
//!
//! The controller only ever produces [`MoveIntent`] values; it never reads or
//! writes the activity store.

use crate::models::TimePeriod;
use crate::planner::MoveIntent;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum DropTarget {
    Activity {
        activity_id: String,
    },
    DaySelector {
        day_number: u32,
    },
    Partition {
        day_number: u32,
        time_period: TimePeriod,
    },
    Slot {
        day_number: u32,
        time_period: TimePeriod,
        position: u32,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum DragState {
    #[default]
    Idle,
    Dragging {
        source: String,
    },
    DraggingOverTarget {
        source: String,
        target: DropTarget,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyboardCommand {
    Pick(String),
    Focus(DropTarget),
    Drop,
    Cancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DragEvent {
    Start { activity_id: String },
    Over(DropTarget),
    Leave,
    Drop,
    Cancel,
    Key(KeyboardCommand),
}

#[derive(Debug, Default)]
pub struct DragController {
    state: DragState,
    gestures: u64,
}

impl DragController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &DragState {
        &self.state
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.state, DragState::Idle)
    }

    pub fn handle(&mut self, event: DragEvent) -> Option<MoveIntent> {
        match event {
            DragEvent::Start { activity_id } | DragEvent::Key(KeyboardCommand::Pick(activity_id)) => {
                self.start(activity_id);
                None
            }
            DragEvent::Over(target) | DragEvent::Key(KeyboardCommand::Focus(target)) => {
                self.over(target);
                None
            }
            DragEvent::Leave => {
                self.leave();
                None
            }
            DragEvent::Drop | DragEvent::Key(KeyboardCommand::Drop) => self.release(),
            DragEvent::Cancel | DragEvent::Key(KeyboardCommand::Cancel) => {
                self.cancel();
                None
            }
        }
    }

    /// Starting over an active gesture discards it; nothing is emitted for it.
    pub fn start(&mut self, activity_id: impl Into<String>) {
        if self.is_active() {
            tracing::debug!(gesture = self.gestures, "interrupted drag gesture discarded");
        }
        self.gestures += 1;
        self.state = DragState::Dragging {
            source: activity_id.into(),
        };
    }

    /// Returns false when no gesture is active.
    pub fn over(&mut self, target: DropTarget) -> bool {
        let source = match std::mem::take(&mut self.state) {
            DragState::Idle => return false,
            DragState::Dragging { source } | DragState::DraggingOverTarget { source, .. } => source,
        };
        self.state = DragState::DraggingOverTarget { source, target };
        true
    }

    pub fn leave(&mut self) {
        if let DragState::DraggingOverTarget { source, .. } = std::mem::take(&mut self.state) {
            self.state = DragState::Dragging { source };
        }
    }

    pub fn cancel(&mut self) {
        if self.is_active() {
            tracing::debug!(gesture = self.gestures, "drag gesture cancelled");
        }
        self.state = DragState::Idle;
    }

    /// Ends the gesture. The controller is `Idle` afterwards whatever the outcome.
    pub fn release(&mut self) -> Option<MoveIntent> {
        let (source, target) = match std::mem::take(&mut self.state) {
            DragState::DraggingOverTarget { source, target } => (source, target),
            DragState::Dragging { source } => {
                tracing::debug!(gesture = self.gestures, activity_id = %source, "dropped outside any target");
                return None;
            }
            DragState::Idle => return None,
        };

        let intent = resolve(source, target);
        if let Some(intent) = intent.as_ref() {
            tracing::debug!(gesture = self.gestures, kind = intent.kind(), activity_id = %intent.activity_id(), "drag produced move intent");
        }
        intent
    }
}

fn resolve(source: String, target: DropTarget) -> Option<MoveIntent> {
    match target {
        DropTarget::Activity { activity_id } if activity_id == source => None,
        DropTarget::Activity { activity_id } => Some(MoveIntent::Reorder {
            activity_id: source,
            target_activity_id: activity_id,
        }),
        DropTarget::DaySelector { day_number: 0 }
        | DropTarget::Partition { day_number: 0, .. }
        | DropTarget::Slot { day_number: 0, .. } => None,
        DropTarget::DaySelector { day_number } => Some(MoveIntent::AppendToDay {
            activity_id: source,
            target_day: day_number,
        }),
        DropTarget::Partition {
            day_number,
            time_period,
        } => Some(MoveIntent::AppendToPartition {
            activity_id: source,
            target_day: day_number,
            target_period: time_period,
        }),
        DropTarget::Slot {
            day_number,
            time_period,
            position,
        } => Some(MoveIntent::InsertAt {
            activity_id: source,
            target_day: day_number,
            target_period: time_period,
            position,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::{DragController, DragEvent, DragState, DropTarget, KeyboardCommand};
    use crate::models::TimePeriod;
    use crate::planner::MoveIntent;

    #[test]
    fn drop_over_activity_emits_reorder_and_returns_to_idle() {
        let mut controller = DragController::new();
        controller.start("a");
        assert!(controller.over(DropTarget::Activity {
            activity_id: "b".to_string()
        }));
        let intent = controller.release();
        assert_eq!(
            intent,
            Some(MoveIntent::Reorder {
                activity_id: "a".to_string(),
                target_activity_id: "b".to_string(),
            })
        );
        assert_eq!(controller.state(), &DragState::Idle);
        assert_eq!(controller.release(), None);
    }

    #[test]
    fn dropping_on_itself_or_nowhere_emits_nothing() {
        let mut controller = DragController::new();
        controller.start("a");
        controller.over(DropTarget::Activity {
            activity_id: "a".to_string(),
        });
        assert_eq!(controller.release(), None);

        controller.start("a");
        controller.over(DropTarget::DaySelector { day_number: 2 });
        controller.leave();
        assert_eq!(controller.state(), &DragState::Dragging { source: "a".to_string() });
        assert_eq!(controller.release(), None);
        assert!(!controller.is_active());
    }

    #[test]
    fn last_target_wins() {
        let mut controller = DragController::new();
        controller.handle(DragEvent::Start {
            activity_id: "a".to_string(),
        });
        controller.handle(DragEvent::Over(DropTarget::DaySelector { day_number: 3 }));
        controller.handle(DragEvent::Over(DropTarget::Slot {
            day_number: 2,
            time_period: TimePeriod::Evening,
            position: 1,
        }));
        assert_eq!(
            controller.handle(DragEvent::Drop),
            Some(MoveIntent::InsertAt {
                activity_id: "a".to_string(),
                target_day: 2,
                target_period: TimePeriod::Evening,
                position: 1,
            })
        );
    }

    #[test]
    fn cancel_discards_gesture() {
        let mut controller = DragController::new();
        controller.start("a");
        controller.over(DropTarget::Partition {
            day_number: 1,
            time_period: TimePeriod::Morning,
        });
        controller.handle(DragEvent::Cancel);
        assert_eq!(controller.state(), &DragState::Idle);
        assert_eq!(controller.handle(DragEvent::Drop), None);
    }

    #[test]
    fn restart_mid_gesture_drops_previous_source() {
        let mut controller = DragController::new();
        controller.start("a");
        controller.over(DropTarget::DaySelector { day_number: 2 });
        controller.start("b");
        controller.over(DropTarget::DaySelector { day_number: 2 });
        assert_eq!(
            controller.release(),
            Some(MoveIntent::AppendToDay {
                activity_id: "b".to_string(),
                target_day: 2,
            })
        );
    }

    #[test]
    fn keyboard_gesture_follows_pointer_transitions() {
        let mut controller = DragController::new();
        assert_eq!(controller.handle(DragEvent::Key(KeyboardCommand::Pick("a".to_string()))), None);
        controller.handle(DragEvent::Key(KeyboardCommand::Focus(DropTarget::Partition {
            day_number: 4,
            time_period: TimePeriod::Afternoon,
        })));
        assert_eq!(
            controller.handle(DragEvent::Key(KeyboardCommand::Drop)),
            Some(MoveIntent::AppendToPartition {
                activity_id: "a".to_string(),
                target_day: 4,
                target_period: TimePeriod::Afternoon,
            })
        );
    }

    #[test]
    fn over_without_gesture_is_ignored() {
        let mut controller = DragController::new();
        assert!(!controller.over(DropTarget::DaySelector { day_number: 1 }));
        assert_eq!(controller.state(), &DragState::Idle);
    }

    #[test]
    fn invalid_day_targets_emit_nothing() {
        let mut controller = DragController::new();
        controller.start("a");
        controller.over(DropTarget::DaySelector { day_number: 0 });
        assert_eq!(controller.release(), None);
    }
}
