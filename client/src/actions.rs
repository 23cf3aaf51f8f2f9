//! Scripted player actions
//!
//! Stands in for a player at the keyboard: on a fixed schedule it digs,
//! builds and moves the cursor, walking across the cell range so that every
//! action touches a different cell.

use shared::messages::{BuildAction, CursorMoved, DigAction};
use shared::Message;

#[derive(Debug, Clone)]
pub struct ActionSettings {
    /// Ticks between digs; 0 disables digging
    pub dig_every: u64,
    /// Ticks between builds; 0 disables building
    pub build_every: u64,
    /// Ticks between cursor updates; 0 disables them
    pub cursor_every: u64,
    /// Cells are addressed as `0..cell_count`
    pub cell_count: i32,
}

impl Default for ActionSettings {
    fn default() -> Self {
        Self {
            dig_every: 90,
            build_every: 150,
            cursor_every: 2,
            cell_count: 4096,
        }
    }
}

pub struct ActionScript {
    settings: ActionSettings,
    next_cell: i32,
}

fn due(every: u64, tick: u64) -> bool {
    every > 0 && tick > 0 && tick % every == 0
}

impl ActionScript {
    pub fn new(settings: ActionSettings) -> Self {
        Self {
            settings,
            next_cell: 0,
        }
    }

    fn take_cell(&mut self) -> i32 {
        let cell = self.next_cell;
        self.next_cell = (self.next_cell + 1) % self.settings.cell_count.max(1);
        cell
    }

    /// Actions the player performs on `tick`. Origins are left blank; the
    /// replicator stamps them.
    pub fn actions_for(&mut self, tick: u64) -> Vec<Message> {
        let mut actions = Vec::new();

        if due(self.settings.dig_every, tick) {
            let cell = self.take_cell();
            actions.push(Message::from(DigAction {
                cell,
                ..DigAction::default()
            }));
        }

        if due(self.settings.build_every, tick) {
            let cell = self.take_cell();
            actions.push(Message::from(BuildAction {
                cell,
                prefab: "Ladder".to_string(),
                orientation: 0,
                materials: vec!["Copper".to_string()],
                ..BuildAction::default()
            }));
        }

        if due(self.settings.cursor_every, tick) {
            let phase = (tick % 360) as f32;
            actions.push(Message::from(CursorMoved {
                x: phase,
                y: phase / 2.0,
                ..CursorMoved::default()
            }));
        }

        actions
    }
}
