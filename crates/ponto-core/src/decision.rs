//! Fallback registration planning from a day's attendance history.
//!
//! The preferred path lets the server decide and commit atomically; this
//! module is only consulted when that endpoint is unsupported. It
//! reconstructs the user's open entrada (if any) from today's records
//! and plans the action(s) that keep at most one site open.

use crate::types::{AttendanceRecord, RecordKind};

/// What the fallback path should submit, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlannedAction {
    /// No open entrada anywhere: open the target site.
    Entrada { site_id: String },
    /// Open entrada at the target site: close it.
    Saida { site_id: String },
    /// Open entrada at a different site: close it first, then open the
    /// target. Must be submitted close-first.
    CloseThenOpen {
        close_site_id: String,
        open_site_id: String,
    },
}

/// Find the user's open entrada, if any: the most recent entrada with no
/// later saida at the same site.
///
/// The backend should never hold two open entradas for one site; if it
/// does, the most recent one is treated as authoritative.
pub fn open_entrada(records: &[AttendanceRecord]) -> Option<&AttendanceRecord> {
    let mut open: Option<&AttendanceRecord> = None;
    for rec in records {
        match rec.kind {
            RecordKind::Entrada => {
                let closed = records.iter().any(|other| {
                    other.kind == RecordKind::Saida
                        && other.site_id == rec.site_id
                        && other.timestamp >= rec.timestamp
                });
                if !closed {
                    let newer = match open {
                        Some(prev) => rec.timestamp > prev.timestamp,
                        None => true,
                    };
                    if newer {
                        open = Some(rec);
                    }
                }
            }
            RecordKind::Saida => {}
        }
    }
    open
}

/// Plan the next action for a scan at `target_site_id` given today's
/// records. Ordering rules:
/// 1. open entrada at the target site → saida there;
/// 2. open entrada elsewhere → saida there, then entrada at the target
///    (never the reverse, so the user is never open at two sites);
/// 3. otherwise → entrada at the target.
pub fn plan(records: &[AttendanceRecord], target_site_id: &str) -> PlannedAction {
    match open_entrada(records) {
        Some(open) if open.site_id == target_site_id => PlannedAction::Saida {
            site_id: target_site_id.to_string(),
        },
        Some(open) => PlannedAction::CloseThenOpen {
            close_site_id: open.site_id.clone(),
            open_site_id: target_site_id.to_string(),
        },
        None => PlannedAction::Entrada {
            site_id: target_site_id.to_string(),
        },
    }
}
