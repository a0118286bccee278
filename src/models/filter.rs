//! Dashboard filter flags.

use serde::{Deserialize, Serialize};

/// User-supplied filter applied after all derivation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Filter {
    /// Hide MRs not authored by the current user.
    pub show_only_mine: bool,

    /// Hide MRs the current user already approves.
    pub skip_approved_by_me: bool,

    /// Exempt the current user's own MRs from the draft and approval filters.
    pub but_still_show_mine: bool,

    /// Hide draft MRs.
    pub do_not_show_drafts: bool,
}
