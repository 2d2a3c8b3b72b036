//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::BTreeMap;

use rbgp_utils::bgp::AfiSafi;

// Tracks, per table, whether a peer has finished sending its initial routes.
//
// A table becomes synchronized when the peer sends End-of-RIB for it, or
// implicitly when a full keepalive interval passes without any UPDATE for
// that table (for peers that never send End-of-RIB).
#[derive(Debug, Default)]
pub struct SyncTracker {
    tables: BTreeMap<AfiSafi, SyncState>,
}

#[derive(Clone, Copy, Debug, Default)]
struct SyncState {
    // An UPDATE was received since the last keepalive.
    upd: bool,
    // The table is synchronized.
    eor: bool,
}

// ===== impl SyncTracker =====

impl SyncTracker {
    pub fn new(tables: impl IntoIterator<Item = AfiSafi>) -> SyncTracker {
        SyncTracker {
            tables: tables
                .into_iter()
                .map(|afi_safi| (afi_safi, SyncState::default()))
                .collect(),
        }
    }

    // Accounts for an UPDATE received for the given table. Returns true if
    // this UPDATE is the End-of-RIB that synchronized the table.
    pub fn update_received(&mut self, afi_safi: AfiSafi, eor: bool) -> bool {
        let Some(state) = self.tables.get_mut(&afi_safi) else {
            return false;
        };
        if eor {
            let newly_synced = !state.eor;
            state.eor = true;
            newly_synced
        } else {
            if !state.eor {
                state.upd = true;
            }
            false
        }
    }

    // Accounts for a received KEEPALIVE. Returns the tables that became
    // synchronized because no UPDATE arrived for them since the previous
    // keepalive.
    pub fn keepalive_received(&mut self) -> Vec<AfiSafi> {
        let mut synced = vec![];
        for (afi_safi, state) in self.tables.iter_mut() {
            if state.eor {
                continue;
            }
            if !state.upd {
                state.eor = true;
                synced.push(*afi_safi);
            }
            state.upd = false;
        }
        synced
    }

    pub fn is_synced(&self, afi_safi: AfiSafi) -> bool {
        self.tables.get(&afi_safi).is_some_and(|state| state.eor)
    }
}

// ===== unit tests =====
