use std::collections::HashSet;
use std::sync::RwLock;

use crate::bus::types::Message;

/// Client-side row-level predicate over the incoming stream.
///
/// The daemon sees every insert for the machine's subscription; this decides
/// which rows are actually ours. Sets are replaced wholesale on discovery
/// ticks and read on every message.
pub struct RowFilter {
    machine_id: String,
    agent_ids: RwLock<HashSet<String>>,
    session_ids: RwLock<HashSet<String>>,
    memberships: RwLock<HashSet<String>>,
}

impl RowFilter {
    pub fn new(machine_id: &str) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            agent_ids: RwLock::new(HashSet::new()),
            session_ids: RwLock::new(HashSet::new()),
            memberships: RwLock::new(HashSet::new()),
        }
    }

    /// Rules in order:
    /// 1. broadcast delivery mode → accept
    /// 2. channel message (channel id, empty target) → accept iff member
    /// 3. addressed message → accept iff the address mentions us
    /// 4. otherwise → drop
    pub fn should_deliver(&self, msg: &Message) -> bool {
        if msg.delivery_mode() == Some("broadcast") {
            return true;
        }

        if let Some(channel_id) = &msg.channel_id {
            if msg.target_address.is_empty() {
                return self
                    .memberships
                    .read()
                    .map(|m| m.contains(channel_id))
                    .unwrap_or(false);
            }
        }

        if !msg.target_address.is_empty() {
            return self.address_mentions_us(&msg.target_address);
        }

        false
    }

    /// The address format is loose (`agent://M/S`, bare ids, comma lists),
    /// so matching is by substring against every identity we carry.
    fn address_mentions_us(&self, address: &str) -> bool {
        if address.contains(&self.machine_id) {
            return true;
        }
        if let Ok(agents) = self.agent_ids.read() {
            if agents.iter().any(|id| address.contains(id.as_str())) {
                return true;
            }
        }
        if let Ok(sessions) = self.session_ids.read() {
            if sessions.iter().any(|id| address.contains(id.as_str())) {
                return true;
            }
        }
        false
    }

    /// Whole-set replacement; takes effect on the next predicate call.
    pub fn update_session_ids(&self, ids: HashSet<String>) {
        if let Ok(mut s) = self.session_ids.write() {
            *s = ids;
        }
    }

    pub fn update_agent_ids(&self, ids: HashSet<String>) {
        if let Ok(mut s) = self.agent_ids.write() {
            *s = ids;
        }
    }

    pub fn update_memberships(&self, channels: HashSet<String>) {
        if let Ok(mut s) = self.memberships.write() {
            *s = channels;
        }
    }

    pub fn memberships(&self) -> HashSet<String> {
        self.memberships.read().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn session_ids(&self) -> HashSet<String> {
        self.session_ids.read().map(|s| s.clone()).unwrap_or_default()
    }
}
