use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::params;

use crate::db::enum_str;
use crate::error::ApiError;
use crate::models::*;
use crate::protocol::RoomEvent;
use crate::rooms::{RoomEngine, RoomState};

/// Result of evaluating a decision's votes against its rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TallyOutcome {
    StillOpen,
    Approved,
    Rejected,
    Vetoed,
}

/// Evaluate the tally rules. `force` is set when a decision deadline has
/// elapsed and the decision must resolve with the votes it has.
///
/// Weights are the per-vote snapshots; members who have not voted count
/// with their current weight when reasoning about unreachable majorities.
pub fn tally(
    decision: &Decision,
    votes: &HashMap<String, Vote>,
    members: &HashMap<String, Member>,
    force: bool,
) -> TallyOutcome {
    let active: Vec<&Member> = members.values().filter(|m| m.active).collect();
    let active_count = active.len();
    let votes_cast = votes.len();
    let all_voted = active.iter().all(|m| votes.contains_key(&m.client_id));

    let approve_weight: f64 = votes.values().filter(|v| v.approve).map(|v| v.weight).sum();
    let reject_weight: f64 = votes.values().filter(|v| !v.approve).map(|v| v.weight).sum();
    let unvoted_weight: f64 = active
        .iter()
        .filter(|m| !votes.contains_key(&m.client_id))
        .map(|m| m.vote_weight)
        .sum();

    match decision.vote_type {
        VoteType::Consensus => {
            // A reviewer's veto kills the decision immediately.
            let vetoed = votes.values().any(|v| {
                v.veto
                    && members
                        .get(&v.voter)
                        .map(|m| m.role == Role::Reviewer)
                        .unwrap_or(false)
            });
            if vetoed {
                return TallyOutcome::Vetoed;
            }
            if votes.values().any(|v| !v.approve) {
                return TallyOutcome::Rejected;
            }
            if active_count > 0 && all_voted {
                return TallyOutcome::Approved;
            }
            if force {
                // Deadline without full agreement is a failure to reach
                // consensus.
                return TallyOutcome::Rejected;
            }
            TallyOutcome::StillOpen
        }
        VoteType::SimpleMajority => {
            if all_voted && votes_cast > 0 {
                return if approve_weight > reject_weight {
                    TallyOutcome::Approved
                } else {
                    TallyOutcome::Rejected
                };
            }
            // Close early once the outcome cannot flip.
            if approve_weight > reject_weight + unvoted_weight {
                return TallyOutcome::Approved;
            }
            if force {
                return if approve_weight > reject_weight {
                    TallyOutcome::Approved
                } else {
                    TallyOutcome::Rejected
                };
            }
            TallyOutcome::StillOpen
        }
        VoteType::Quorum => {
            let required = decision.required_votes.unwrap_or(active_count as u32) as usize;
            if votes_cast >= required {
                return if approve_weight > reject_weight {
                    TallyOutcome::Approved
                } else {
                    TallyOutcome::Rejected
                };
            }
            if force {
                return TallyOutcome::Rejected;
            }
            TallyOutcome::StillOpen
        }
        VoteType::Weighted => {
            let cast = approve_weight + reject_weight;
            if all_voted && votes_cast > 0 {
                return if approve_weight / cast > 0.5 {
                    TallyOutcome::Approved
                } else {
                    TallyOutcome::Rejected
                };
            }
            // Unbeatable: approvals already outweigh everything else.
            if cast + unvoted_weight > 0.0
                && approve_weight / (cast + unvoted_weight) > 0.5
            {
                return TallyOutcome::Approved;
            }
            if force {
                return if cast > 0.0 && approve_weight / cast > 0.5 {
                    TallyOutcome::Approved
                } else {
                    TallyOutcome::Rejected
                };
            }
            TallyOutcome::StillOpen
        }
    }
}

impl RoomEngine {
    // --- Proposals ---

    pub async fn propose_decision(
        self: &Arc<Self>,
        room_id: &str,
        channel_id: &str,
        proposed_by: &str,
        text: &str,
        vote_type: VoteType,
        required_votes: Option<u32>,
        deadline_seconds: Option<u64>,
    ) -> Result<Decision, ApiError> {
        let handle = self.room_handle(room_id)?;
        let mut state = handle.lock().await;
        state.require_active()?;
        state.require_member(proposed_by)?;
        if !state.channels.contains_key(channel_id) {
            return Err(ApiError::NotFound(format!(
                "channel {channel_id} not found in room {room_id}"
            )));
        }
        if text.is_empty() || text.chars().count() > MAX_TEXT_CHARS {
            return Err(ApiError::ValidationFailed(format!(
                "text must be 1-{MAX_TEXT_CHARS} characters"
            )));
        }
        if vote_type == VoteType::Quorum && required_votes.map(|n| n == 0).unwrap_or(true) {
            return Err(ApiError::ValidationFailed(
                "quorum decisions need required_votes >= 1".to_string(),
            ));
        }

        let now = chrono::Utc::now();
        let decision = Decision {
            id: uuid::Uuid::new_v4().to_string(),
            room_id: room_id.to_string(),
            channel_id: channel_id.to_string(),
            proposed_by: proposed_by.to_string(),
            text: text.to_string(),
            vote_type,
            required_votes,
            status: DecisionStatus::Open,
            created_at: now.to_rfc3339(),
            closed_at: None,
            parent_id: None,
            deadline_at: deadline_seconds
                .map(|s| (now + chrono::Duration::seconds(s as i64)).to_rfc3339()),
            alternatives: vec![],
            amendments: vec![],
            pro_arguments: vec![],
            con_arguments: vec![],
        };
        self.persist_decision(&decision)?;
        state.decisions.insert(decision.id.clone(), decision.clone());

        let recipients = state.recipients();
        self.fanout.emit(
            room_id,
            recipients,
            RoomEvent::DecisionProposed {
                room_id: room_id.to_string(),
                decision_id: decision.id.clone(),
                channel_id: channel_id.to_string(),
                proposed_by: proposed_by.to_string(),
                text: text.to_string(),
                vote_type,
            },
        );
        drop(state);

        if let Some(seconds) = deadline_seconds {
            let engine = self.clone();
            let room = room_id.to_string();
            let decision_id = decision.id.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs(seconds)).await;
                engine.deadline_tally(&room, &decision_id).await;
            });
        }
        Ok(decision)
    }

    fn persist_decision(&self, decision: &Decision) -> Result<(), ApiError> {
        self.db
            .conn()
            .execute(
                "INSERT INTO decisions (id, room_id, channel_id, proposed_by, text, vote_type,
                                        required_votes, status, parent_id, deadline_at, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'open', ?8, ?9, ?10)",
                params![
                    &decision.id,
                    &decision.room_id,
                    &decision.channel_id,
                    &decision.proposed_by,
                    &decision.text,
                    enum_str(&decision.vote_type),
                    decision.required_votes,
                    &decision.parent_id,
                    &decision.deadline_at,
                    &decision.created_at,
                ],
            )
            .map_err(ApiError::from)?;
        Ok(())
    }

    /// An alternative is a sibling Decision linked under the original. It is
    /// created fresh here, so the alternatives graph stays a forest.
    pub async fn propose_alternative(
        &self,
        parent_decision_id: &str,
        proposed_by: &str,
        text: &str,
        vote_type: Option<VoteType>,
    ) -> Result<Decision, ApiError> {
        let handle = self.room_of_decision(parent_decision_id).await?;
        let mut state = handle.lock().await;
        state.require_active()?;
        state.require_member(proposed_by)?;
        if text.is_empty() || text.chars().count() > MAX_TEXT_CHARS {
            return Err(ApiError::ValidationFailed(format!(
                "text must be 1-{MAX_TEXT_CHARS} characters"
            )));
        }
        let parent = state
            .decisions
            .get(parent_decision_id)
            .ok_or_else(|| {
                ApiError::NotFound(format!("decision {parent_decision_id} not found"))
            })?
            .clone();

        let now = chrono::Utc::now().to_rfc3339();
        let child = Decision {
            id: uuid::Uuid::new_v4().to_string(),
            room_id: parent.room_id.clone(),
            channel_id: parent.channel_id.clone(),
            proposed_by: proposed_by.to_string(),
            text: text.to_string(),
            vote_type: vote_type.unwrap_or(parent.vote_type),
            required_votes: parent.required_votes,
            status: DecisionStatus::Open,
            created_at: now,
            closed_at: None,
            parent_id: Some(parent.id.clone()),
            deadline_at: None,
            alternatives: vec![],
            amendments: vec![],
            pro_arguments: vec![],
            con_arguments: vec![],
        };
        let ordinal = parent.alternatives.len() as i64;
        {
            let mut conn = self.db.conn();
            let tx = conn.transaction().map_err(ApiError::from)?;
            tx.execute(
                "INSERT INTO decisions (id, room_id, channel_id, proposed_by, text, vote_type,
                                        required_votes, status, parent_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'open', ?8, ?9)",
                params![
                    &child.id,
                    &child.room_id,
                    &child.channel_id,
                    proposed_by,
                    text,
                    enum_str(&child.vote_type),
                    child.required_votes,
                    &child.parent_id,
                    &child.created_at,
                ],
            )
            .map_err(ApiError::from)?;
            tx.execute(
                "INSERT INTO alternatives (decision_id, alternative_id, ordinal) VALUES (?1, ?2, ?3)",
                params![&parent.id, &child.id, ordinal],
            )
            .map_err(ApiError::from)?;
            tx.commit().map_err(ApiError::from)?;
        }

        if let Some(p) = state.decisions.get_mut(parent_decision_id) {
            p.alternatives.push(child.id.clone());
        }
        state.decisions.insert(child.id.clone(), child.clone());

        let recipients = state.recipients();
        self.fanout.emit(
            &child.room_id,
            recipients,
            RoomEvent::AlternativeProposed {
                room_id: child.room_id.clone(),
                parent_decision_id: parent.id.clone(),
                decision_id: child.id.clone(),
                proposed_by: proposed_by.to_string(),
            },
        );
        Ok(child)
    }

    // --- Amendments ---

    pub async fn propose_amendment(
        &self,
        decision_id: &str,
        proposed_by: &str,
        text: &str,
    ) -> Result<Amendment, ApiError> {
        let handle = self.room_of_decision(decision_id).await?;
        let mut state = handle.lock().await;
        state.require_active()?;
        state.require_member(proposed_by)?;
        if text.is_empty() || text.chars().count() > MAX_TEXT_CHARS {
            return Err(ApiError::ValidationFailed(format!(
                "text must be 1-{MAX_TEXT_CHARS} characters"
            )));
        }
        let decision = state
            .decisions
            .get(decision_id)
            .ok_or_else(|| ApiError::NotFound(format!("decision {decision_id} not found")))?;
        if decision.status.is_terminal() {
            return Err(ApiError::Conflict(format!(
                "decision {decision_id} is {}",
                enum_str(&decision.status)
            )));
        }
        let channel_id = decision.channel_id.clone();
        let room_id = decision.room_id.clone();

        let amendment = Amendment {
            id: uuid::Uuid::new_v4().to_string(),
            decision_id: decision_id.to_string(),
            proposed_by: proposed_by.to_string(),
            text: text.to_string(),
            accepted: false,
            created_at: chrono::Utc::now().to_rfc3339(),
            accepted_at: None,
        };
        self.db
            .conn()
            .execute(
                "INSERT INTO amendments (id, decision_id, proposed_by, text, accepted, created_at)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5)",
                params![
                    &amendment.id,
                    decision_id,
                    proposed_by,
                    text,
                    &amendment.created_at
                ],
            )
            .map_err(ApiError::from)?;

        if let Some(d) = state.decisions.get_mut(decision_id) {
            d.amendments.push(amendment.clone());
        }
        let meta = serde_json::json!({
            "decision_id": decision_id,
            "amendment_id": amendment.id,
        });
        self.append_message(
            &mut state,
            &channel_id,
            proposed_by,
            text,
            RoomMessageKind::Amendment,
            None,
            meta,
        )?;

        let recipients = state.recipients();
        self.fanout.emit(
            &room_id,
            recipients,
            RoomEvent::AmendmentProposed {
                room_id: room_id.clone(),
                decision_id: decision_id.to_string(),
                amendment: amendment.clone(),
            },
        );
        Ok(amendment)
    }

    /// Accept an amendment, making its text the decision's effective text.
    /// Only the decision's proposer or a coordinator may accept. Accepting
    /// twice is a no-op, not an error.
    pub async fn accept_amendment(
        &self,
        decision_id: &str,
        amendment_id: &str,
        accepted_by: &str,
    ) -> Result<Decision, ApiError> {
        let handle = self.room_of_decision(decision_id).await?;
        let mut state = handle.lock().await;
        state.require_active()?;
        let member = state.require_member(accepted_by)?.clone();

        let decision = state
            .decisions
            .get(decision_id)
            .ok_or_else(|| ApiError::NotFound(format!("decision {decision_id} not found")))?;
        if decision.status.is_terminal() {
            return Err(ApiError::Conflict(format!(
                "decision {decision_id} is {}",
                enum_str(&decision.status)
            )));
        }
        if decision.proposed_by != accepted_by && member.role != Role::Coordinator {
            return Err(ApiError::Forbidden(
                "only the proposer or a coordinator may accept amendments".to_string(),
            ));
        }
        let room_id = decision.room_id.clone();
        let Some(amendment) = decision.amendments.iter().find(|a| a.id == amendment_id) else {
            return Err(ApiError::NotFound(format!(
                "amendment {amendment_id} not found on decision {decision_id}"
            )));
        };
        if amendment.accepted {
            // Idempotent: the amendment is already in effect.
            return Ok(decision.clone());
        }

        let accepted_at = chrono::Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "UPDATE amendments SET accepted = 1, accepted_at = ?1 WHERE id = ?2",
                params![&accepted_at, amendment_id],
            )
            .map_err(ApiError::from)?;

        let decision = state.decisions.get_mut(decision_id).unwrap();
        if let Some(a) = decision.amendments.iter_mut().find(|a| a.id == amendment_id) {
            a.accepted = true;
            a.accepted_at = Some(accepted_at);
        }
        let snapshot = decision.clone();
        let effective = snapshot.effective_text().to_string();

        let recipients = state.recipients();
        self.fanout.emit(
            &room_id,
            recipients,
            RoomEvent::AmendmentAccepted {
                room_id: room_id.clone(),
                decision_id: decision_id.to_string(),
                amendment_id: amendment_id.to_string(),
                effective_text: effective,
            },
        );
        Ok(snapshot)
    }

    // --- Debate ---

    pub async fn add_argument(
        &self,
        decision_id: &str,
        from: &str,
        position: Position,
        text: &str,
        evidence: Vec<String>,
    ) -> Result<DebateArgument, ApiError> {
        let handle = self.room_of_decision(decision_id).await?;
        let mut state = handle.lock().await;
        state.require_active()?;
        state.require_member(from)?;
        if text.is_empty() || text.chars().count() > MAX_TEXT_CHARS {
            return Err(ApiError::ValidationFailed(format!(
                "text must be 1-{MAX_TEXT_CHARS} characters"
            )));
        }
        let decision = state
            .decisions
            .get(decision_id)
            .ok_or_else(|| ApiError::NotFound(format!("decision {decision_id} not found")))?;
        let room_id = decision.room_id.clone();
        let channel_id = decision.channel_id.clone();

        let argument = DebateArgument {
            id: uuid::Uuid::new_v4().to_string(),
            decision_id: decision_id.to_string(),
            from_client: from.to_string(),
            position,
            text: text.to_string(),
            evidence,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.db
            .conn()
            .execute(
                "INSERT INTO debate_args (id, decision_id, from_client, position, text, evidence, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    &argument.id,
                    decision_id,
                    from,
                    enum_str(&position),
                    text,
                    serde_json::to_string(&argument.evidence).unwrap_or_else(|_| "[]".into()),
                    &argument.created_at
                ],
            )
            .map_err(ApiError::from)?;

        if let Some(d) = state.decisions.get_mut(decision_id) {
            match position {
                Position::Pro => d.pro_arguments.push(argument.clone()),
                Position::Con => d.con_arguments.push(argument.clone()),
            }
        }
        let meta = serde_json::json!({
            "decision_id": decision_id,
            "position": enum_str(&position),
        });
        self.append_message(
            &mut state,
            &channel_id,
            from,
            text,
            RoomMessageKind::Argument,
            None,
            meta,
        )?;

        let recipients = state.recipients();
        self.fanout.emit(
            &room_id,
            recipients,
            RoomEvent::ArgumentAdded {
                room_id: room_id.clone(),
                argument: argument.clone(),
            },
        );
        Ok(argument)
    }

    // --- Voting ---

    /// Record (or overwrite) a vote and re-tally. The member's weight is
    /// snapshotted into the vote; later weight changes never rewrite it.
    pub async fn vote(
        &self,
        decision_id: &str,
        voter: &str,
        approve: bool,
        veto: bool,
    ) -> Result<(Vote, DecisionStatus), ApiError> {
        let handle = self.room_of_decision(decision_id).await?;
        let mut state = handle.lock().await;
        state.require_active()?;
        let member = state.require_member(voter)?.clone();

        let decision = state
            .decisions
            .get(decision_id)
            .ok_or_else(|| ApiError::NotFound(format!("decision {decision_id} not found")))?;
        if decision.status.is_terminal() {
            return Err(ApiError::Conflict(format!(
                "decision {decision_id} is already {}",
                enum_str(&decision.status)
            )));
        }
        let room_id = decision.room_id.clone();

        let vote = Vote {
            decision_id: decision_id.to_string(),
            voter: voter.to_string(),
            approve,
            veto,
            weight: member.vote_weight,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        self.db
            .conn()
            .execute(
                "INSERT INTO votes (decision_id, voter, approve, veto, weight, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(decision_id, voter)
                 DO UPDATE SET approve = ?3, veto = ?4, weight = ?5, created_at = ?6",
                params![
                    decision_id,
                    voter,
                    approve as i64,
                    veto as i64,
                    vote.weight,
                    &vote.created_at
                ],
            )
            .map_err(ApiError::from)?;
        state
            .votes
            .entry(decision_id.to_string())
            .or_default()
            .insert(voter.to_string(), vote.clone());

        let recipients = state.recipients();
        self.fanout.emit(
            &room_id,
            recipients,
            RoomEvent::VoteCast {
                room_id: room_id.clone(),
                decision_id: decision_id.to_string(),
                vote: vote.clone(),
            },
        );

        let status = self.run_tally(&mut state, decision_id, false)?;
        Ok((vote, status))
    }

    /// Proposer withdraws an open decision.
    pub async fn withdraw_decision(
        &self,
        decision_id: &str,
        client_id: &str,
    ) -> Result<Decision, ApiError> {
        self.close_by_proposer(decision_id, client_id, DecisionStatus::Withdrawn)
            .await
    }

    /// Proposer marks an open decision superseded (typically after an
    /// accepted amendment spawned a replacement).
    pub async fn supersede_decision(
        &self,
        decision_id: &str,
        client_id: &str,
    ) -> Result<Decision, ApiError> {
        self.close_by_proposer(decision_id, client_id, DecisionStatus::Superseded)
            .await
    }

    async fn close_by_proposer(
        &self,
        decision_id: &str,
        client_id: &str,
        target: DecisionStatus,
    ) -> Result<Decision, ApiError> {
        let handle = self.room_of_decision(decision_id).await?;
        let mut state = handle.lock().await;
        state.require_active()?;
        state.require_member(client_id)?;
        let decision = state
            .decisions
            .get(decision_id)
            .ok_or_else(|| ApiError::NotFound(format!("decision {decision_id} not found")))?;
        if decision.status.is_terminal() {
            return Err(ApiError::Conflict(format!(
                "decision {decision_id} is already {}",
                enum_str(&decision.status)
            )));
        }
        if decision.proposed_by != client_id {
            return Err(ApiError::Forbidden(
                "only the proposer may do that".to_string(),
            ));
        }
        self.close_decision(&mut state, decision_id, target)?;
        Ok(state.decisions.get(decision_id).unwrap().clone())
    }

    /// Deadline elapsed: force a resolution with the votes on hand.
    pub async fn deadline_tally(&self, room_id: &str, decision_id: &str) {
        let Ok(handle) = self.room_handle(room_id) else {
            return;
        };
        let mut state = handle.lock().await;
        let open = state
            .decisions
            .get(decision_id)
            .map(|d| d.status == DecisionStatus::Open)
            .unwrap_or(false);
        if !open {
            return;
        }
        if let Err(e) = self.run_tally(&mut state, decision_id, true) {
            tracing::warn!(decision_id, "deadline tally failed: {e}");
        }
    }

    /// Tally and, on a terminal outcome, close the decision. Returns the
    /// (possibly unchanged) status.
    fn run_tally(
        &self,
        state: &mut RoomState,
        decision_id: &str,
        force: bool,
    ) -> Result<DecisionStatus, ApiError> {
        let decision = state
            .decisions
            .get(decision_id)
            .ok_or_else(|| ApiError::NotFound(format!("decision {decision_id} not found")))?;
        let empty = HashMap::new();
        let votes = state.votes.get(decision_id).unwrap_or(&empty);
        let outcome = tally(decision, votes, &state.members, force);
        let target = match outcome {
            TallyOutcome::StillOpen => return Ok(DecisionStatus::Open),
            TallyOutcome::Approved => DecisionStatus::Approved,
            TallyOutcome::Rejected => DecisionStatus::Rejected,
            TallyOutcome::Vetoed => DecisionStatus::Vetoed,
        };
        self.close_decision(state, decision_id, target)?;
        Ok(target)
    }

    fn close_decision(
        &self,
        state: &mut RoomState,
        decision_id: &str,
        target: DecisionStatus,
    ) -> Result<(), ApiError> {
        let closed_at = chrono::Utc::now().to_rfc3339();
        self.db
            .conn()
            .execute(
                "UPDATE decisions SET status = ?1, closed_at = ?2 WHERE id = ?3",
                params![enum_str(&target), &closed_at, decision_id],
            )
            .map_err(ApiError::from)?;
        let room_id = state.room.room_id.clone();
        if let Some(d) = state.decisions.get_mut(decision_id) {
            d.status = target;
            d.closed_at = Some(closed_at.clone());
        }
        let recipients = state.recipients();
        self.fanout.emit(
            &room_id,
            recipients,
            RoomEvent::DecisionClosed {
                room_id: room_id.clone(),
                decision_id: decision_id.to_string(),
                status: enum_str(&target),
                closed_at,
            },
        );
        tracing::info!(decision_id, status = enum_str(&target), "decision closed");
        Ok(())
    }

    // --- Derived read state ---

    /// Full decision view: effective text, votes, and the blocking critiques
    /// surfaced for tallying clients. The broker itself never blocks on
    /// critiques.
    pub async fn decision_view(&self, decision_id: &str) -> Result<serde_json::Value, ApiError> {
        let handle = self.room_of_decision(decision_id).await?;
        let state = handle.lock().await;
        let decision = state
            .decisions
            .get(decision_id)
            .ok_or_else(|| ApiError::NotFound(format!("decision {decision_id} not found")))?;

        let mut target_ids: Vec<&str> = vec![decision_id];
        target_ids.extend(decision.amendments.iter().map(|a| a.id.as_str()));
        target_ids.extend(decision.alternatives.iter().map(|s| s.as_str()));
        let blocking: Vec<&Critique> = state
            .critiques
            .iter()
            .filter(|c| {
                c.severity == Severity::Blocking
                    && target_ids.contains(&c.target_message_id.as_str())
            })
            .collect();

        let empty = HashMap::new();
        let votes = state.votes.get(decision_id).unwrap_or(&empty);
        Ok(serde_json::json!({
            "decision": decision,
            "effective_text": decision.effective_text(),
            "votes": votes.values().collect::<Vec<_>>(),
            "blocking_critiques": blocking,
        }))
    }

    pub async fn debate_summary(&self, decision_id: &str) -> Result<serde_json::Value, ApiError> {
        let handle = self.room_of_decision(decision_id).await?;
        let state = handle.lock().await;
        let decision = state
            .decisions
            .get(decision_id)
            .ok_or_else(|| ApiError::NotFound(format!("decision {decision_id} not found")))?;
        Ok(serde_json::json!({
            "decision_id": decision.id,
            "effective_text": decision.effective_text(),
            "status": decision.status,
            "pro": decision.pro_arguments,
            "con": decision.con_arguments,
            "pro_count": decision.pro_arguments.len(),
            "con_count": decision.con_arguments.len(),
            "alternatives": decision.alternatives,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(client: &str, role: Role, weight: f64) -> Member {
        Member {
            room_id: "r".into(),
            client_id: client.into(),
            role,
            vote_weight: weight,
            joined_at: "2025-01-01T00:00:00Z".into(),
            active: true,
        }
    }

    fn vote(voter: &str, approve: bool, veto: bool, weight: f64) -> Vote {
        Vote {
            decision_id: "d".into(),
            voter: voter.into(),
            approve,
            veto,
            weight,
            created_at: "2025-01-01T00:00:00Z".into(),
        }
    }

    fn decision(vote_type: VoteType, required: Option<u32>) -> Decision {
        Decision {
            id: "d".into(),
            room_id: "r".into(),
            channel_id: "main".into(),
            proposed_by: "c".into(),
            text: "t".into(),
            vote_type,
            required_votes: required,
            status: DecisionStatus::Open,
            created_at: "2025-01-01T00:00:00Z".into(),
            closed_at: None,
            parent_id: None,
            deadline_at: None,
            alternatives: vec![],
            amendments: vec![],
            pro_arguments: vec![],
            con_arguments: vec![],
        }
    }

    fn members(list: &[(&str, Role, f64)]) -> HashMap<String, Member> {
        list.iter()
            .map(|(c, r, w)| (c.to_string(), member(c, *r, *w)))
            .collect()
    }

    fn votes(list: &[(&str, bool, bool, f64)]) -> HashMap<String, Vote> {
        list.iter()
            .map(|(v, a, x, w)| (v.to_string(), vote(v, *a, *x, *w)))
            .collect()
    }

    #[test]
    fn consensus_needs_everyone() {
        let m = members(&[
            ("c", Role::Coordinator, 2.0),
            ("v", Role::Reviewer, 1.0),
            ("w", Role::Coder, 1.0),
        ]);
        let d = decision(VoteType::Consensus, None);

        let partial = votes(&[("c", true, false, 2.0)]);
        assert_eq!(tally(&d, &partial, &m, false), TallyOutcome::StillOpen);

        let all = votes(&[
            ("c", true, false, 2.0),
            ("v", true, false, 1.0),
            ("w", true, false, 1.0),
        ]);
        assert_eq!(tally(&d, &all, &m, false), TallyOutcome::Approved);

        let one_nay = votes(&[("c", true, false, 2.0), ("w", false, false, 1.0)]);
        assert_eq!(tally(&d, &one_nay, &m, false), TallyOutcome::Rejected);
    }

    #[test]
    fn reviewer_veto_is_immediate() {
        let m = members(&[
            ("c", Role::Coordinator, 2.0),
            ("v", Role::Reviewer, 1.0),
            ("w", Role::Coder, 1.0),
        ]);
        let d = decision(VoteType::Consensus, None);
        let v = votes(&[("v", true, true, 1.0)]);
        assert_eq!(tally(&d, &v, &m, false), TallyOutcome::Vetoed);
    }

    #[test]
    fn veto_from_non_reviewer_is_ignored() {
        let m = members(&[("c", Role::Coordinator, 2.0), ("w", Role::Coder, 1.0)]);
        let d = decision(VoteType::Consensus, None);
        let v = votes(&[("w", true, true, 1.0)]);
        assert_eq!(tally(&d, &v, &m, false), TallyOutcome::StillOpen);
    }

    #[test]
    fn simple_majority_weighs_votes() {
        let m = members(&[
            ("c", Role::Coordinator, 2.0),
            ("r", Role::Researcher, 1.5),
            ("w", Role::Coder, 1.0),
        ]);
        let d = decision(VoteType::SimpleMajority, None);

        // Coordinator alone outweighs everyone else combined: early close.
        let early = votes(&[("c", true, false, 2.0), ("r", true, false, 1.5)]);
        assert_eq!(tally(&d, &early, &m, false), TallyOutcome::Approved);

        // Split with all voted: 2.0 approve vs 2.5 reject.
        let split = votes(&[
            ("c", true, false, 2.0),
            ("r", false, false, 1.5),
            ("w", false, false, 1.0),
        ]);
        assert_eq!(tally(&d, &split, &m, false), TallyOutcome::Rejected);

        // No early rejection before everyone voted.
        let pending = votes(&[("w", false, false, 1.0)]);
        assert_eq!(tally(&d, &pending, &m, false), TallyOutcome::StillOpen);
    }

    #[test]
    fn quorum_resolves_at_threshold() {
        let m = members(&[
            ("a", Role::Member, 1.0),
            ("b", Role::Member, 1.0),
            ("c", Role::Member, 1.0),
            ("d", Role::Member, 1.0),
        ]);
        let d = decision(VoteType::Quorum, Some(2));

        let one = votes(&[("a", true, false, 1.0)]);
        assert_eq!(tally(&d, &one, &m, false), TallyOutcome::StillOpen);

        let two = votes(&[("a", true, false, 1.0), ("b", true, false, 1.0)]);
        assert_eq!(tally(&d, &two, &m, false), TallyOutcome::Approved);

        let tied = votes(&[("a", true, false, 1.0), ("b", false, false, 1.0)]);
        assert_eq!(tally(&d, &tied, &m, false), TallyOutcome::Rejected);
    }

    #[test]
    fn weighted_ratio_over_half() {
        let m = members(&[
            ("c", Role::Coordinator, 2.0),
            ("w", Role::Coder, 1.0),
            ("t", Role::Tester, 1.0),
        ]);
        let d = decision(VoteType::Weighted, None);

        let all = votes(&[
            ("c", true, false, 2.0),
            ("w", false, false, 1.0),
            ("t", false, false, 1.0),
        ]);
        // 2.0 / 4.0 = 0.5, not strictly greater.
        assert_eq!(tally(&d, &all, &m, false), TallyOutcome::Rejected);

        let approved = votes(&[
            ("c", true, false, 2.0),
            ("w", true, false, 1.0),
            ("t", false, false, 1.0),
        ]);
        assert_eq!(tally(&d, &approved, &m, false), TallyOutcome::Approved);
    }

    #[test]
    fn deadline_forces_resolution() {
        let m = members(&[("a", Role::Member, 1.0), ("b", Role::Member, 1.0)]);
        let d = decision(VoteType::SimpleMajority, None);
        let v = votes(&[("a", true, false, 1.0)]);
        assert_eq!(tally(&d, &v, &m, false), TallyOutcome::StillOpen);
        assert_eq!(tally(&d, &v, &m, true), TallyOutcome::Approved);

        let none = HashMap::new();
        assert_eq!(tally(&d, &none, &m, true), TallyOutcome::Rejected);

        // Consensus without full participation fails at the deadline.
        let cd = decision(VoteType::Consensus, None);
        assert_eq!(tally(&cd, &v, &m, true), TallyOutcome::Rejected);
    }

    #[test]
    fn weight_snapshot_governs_tally() {
        // The member's weight changed after voting; the recorded snapshot
        // is what counts.
        let mut m = members(&[("a", Role::Member, 1.0), ("b", Role::Member, 1.0)]);
        let d = decision(VoteType::SimpleMajority, None);
        let v = votes(&[
            ("a", true, false, 5.0), // snapshot taken when weight was 5
            ("b", false, false, 1.0),
        ]);
        m.get_mut("a").unwrap().vote_weight = 0.1;
        assert_eq!(tally(&d, &v, &m, false), TallyOutcome::Approved);
    }
}
