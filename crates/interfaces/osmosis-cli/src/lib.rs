pub mod commands;

use clap::ValueEnum;
use osmosis_core::policy::{ConflictPolicy, DeletedPolicy};
use osmosis_core::SyncMode;

#[derive(ValueEnum, Clone, Debug, Copy)]
pub enum CliConflictPolicy {
    Skip,
    Ask,
    Replace,
    Duplicate,
}

#[derive(ValueEnum, Clone, Debug, Copy)]
pub enum CliDeletedPolicy {
    Skip,
    Ask,
    Replace,
}

impl From<CliConflictPolicy> for ConflictPolicy {
    fn from(p: CliConflictPolicy) -> Self {
        match p {
            CliConflictPolicy::Skip => ConflictPolicy::Skip,
            CliConflictPolicy::Ask => ConflictPolicy::Ask,
            CliConflictPolicy::Replace => ConflictPolicy::Replace,
            CliConflictPolicy::Duplicate => ConflictPolicy::Duplicate,
        }
    }
}

impl From<CliDeletedPolicy> for DeletedPolicy {
    fn from(p: CliDeletedPolicy) -> Self {
        match p {
            CliDeletedPolicy::Skip => DeletedPolicy::Skip,
            CliDeletedPolicy::Ask => DeletedPolicy::Ask,
            CliDeletedPolicy::Replace => DeletedPolicy::Replace,
        }
    }
}

pub fn mode_for(two_way: bool) -> SyncMode {
    if two_way {
        SyncMode::TwoWay
    } else {
        SyncMode::OneWay
    }
}
