use std::collections::{BTreeSet, HashSet};

use shared::{
    domain::{ChatMessageId, UserId},
    model::{ChatMessage, ReactionVote, ReactionVotes, RoomScope},
    protocol::ChatPayload,
};
use tracing::{debug, warn};

use crate::channel::{MessageAction, PageEntry, REACTION_ACTION_TYPE};

/// Result of decoding one page of raw channel entries.
#[derive(Debug, Default)]
pub struct ProcessedPage {
    /// Surviving creations in ascending `created_at` order.
    pub messages: Vec<ChatMessage>,
    /// Ids retracted by deletion entries on the same page.
    pub deleted: HashSet<ChatMessageId>,
}

/// Decodes a page, drops filtered creations, then retracts every creation
/// whose id is deleted anywhere on the page. Undecodable entries are skipped
/// without affecting their siblings.
pub fn process_page(
    entries: &[PageEntry],
    active_filters: &BTreeSet<String>,
    scope: &RoomScope<'_>,
) -> ProcessedPage {
    let mut created: Vec<ChatMessage> = Vec::with_capacity(entries.len());
    let mut seen: HashSet<ChatMessageId> = HashSet::new();
    let mut deleted: HashSet<ChatMessageId> = HashSet::new();

    for entry in entries {
        let payload = match ChatPayload::decode(&entry.payload) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    channel_message_id = %entry.channel_message_id,
                    "history: dropping undecodable entry: {err}"
                );
                continue;
            }
        };

        if let Some(id) = payload.deleted_id() {
            deleted.insert(id.clone());
            continue;
        }

        if payload.is_filtered_by(active_filters) {
            debug!(
                channel_message_id = %entry.channel_message_id,
                "history: skipping filtered entry"
            );
            continue;
        }

        let Some(mut message) = ChatMessage::from_created_payload(
            &payload,
            entry.channel_message_id.clone(),
            entry.created_at,
            scope,
        ) else {
            continue;
        };
        if !seen.insert(message.id().clone()) {
            continue;
        }
        message.reactions = votes_from_actions(&entry.actions, scope.local_user_id);
        created.push(message);
    }

    created.retain(|message| !deleted.contains(message.id()));
    created.sort_by_key(|message| message.created_at);

    ProcessedPage {
        messages: created,
        deleted,
    }
}

pub fn vote_from_action(action: &MessageAction, local_user_id: &UserId) -> Option<ReactionVote> {
    if action.action_type != REACTION_ACTION_TYPE {
        return None;
    }
    Some(ReactionVote {
        vote_id: action.action_id.clone(),
        reaction_kind: action.value.clone(),
        is_mine: &action.sender_id == local_user_id,
    })
}

fn votes_from_actions(actions: &[MessageAction], local_user_id: &UserId) -> ReactionVotes {
    let mut votes = ReactionVotes::new();
    for action in actions {
        if let Some(vote) = vote_from_action(action, local_user_id) {
            votes.push(vote);
        }
    }
    votes
}
