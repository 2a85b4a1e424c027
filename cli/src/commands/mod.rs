mod helpers;
mod import;
mod record;
mod sync;
mod weight;

pub(crate) use import::cmd_import_readings;
pub(crate) use record::{EditArgs, cmd_delete, cmd_edit, cmd_list, cmd_show};
pub(crate) use sync::{cmd_backfill, cmd_recompute, cmd_sync, cmd_week};
pub(crate) use weight::{cmd_weight_initial, cmd_weight_progress, cmd_weight_target};
