use crate::supervisor::TunnelSnapshot;

/// TUI state. The table is a read-only view over record snapshots; it is
/// replaced wholesale on every tick or bus update.
pub struct App {
    rows: Vec<TunnelSnapshot>,
    quitting: bool,
}

impl App {
    pub fn new(rows: Vec<TunnelSnapshot>) -> Self {
        Self {
            rows,
            quitting: false,
        }
    }

    pub fn set_rows(&mut self, rows: Vec<TunnelSnapshot>) {
        self.rows = rows;
    }

    pub fn rows(&self) -> &[TunnelSnapshot] {
        &self.rows
    }

    pub fn begin_shutdown(&mut self) {
        self.quitting = true;
    }

    pub fn quitting(&self) -> bool {
        self.quitting
    }
}
