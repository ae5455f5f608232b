// src/handlers.rs
use std::convert::Infallible;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    Json,
};
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    error::ApiError,
    identity::AuthUser,
    models::{
        HasVotedResponse, ListQuery, NewPoll, Poll, PollId, PollResults, Tally, TallyEvent, Vote,
        VoteRequest,
    },
    poll::VotingService,
};

/// Liveness probe
pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// List public polls, newest first
pub async fn list_polls(
    State(voting): State<VotingService>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Poll>>, ApiError> {
    Ok(Json(voting.list_public_polls(query.limit).await?))
}

/// List the caller's own polls, public and private
pub async fn my_polls(
    State(voting): State<VotingService>,
    user: AuthUser,
) -> Result<Json<Vec<Poll>>, ApiError> {
    Ok(Json(voting.list_polls_by_owner(user.id).await?))
}

/// Create a poll owned by the caller
pub async fn create_poll(
    State(voting): State<VotingService>,
    user: AuthUser,
    Json(payload): Json<NewPoll>,
) -> Result<(StatusCode, Json<Poll>), ApiError> {
    let poll = voting.create_poll(user.id, payload).await?;
    Ok((StatusCode::CREATED, Json(poll)))
}

/// Fetch a single poll. Private polls are reachable by id.
pub async fn get_poll(
    State(voting): State<VotingService>,
    Path(poll_id): Path<PollId>,
) -> Result<Json<Poll>, ApiError> {
    Ok(Json(voting.get_poll(poll_id).await?))
}

/// Delete a poll and its votes (owner only)
pub async fn delete_poll(
    State(voting): State<VotingService>,
    Path(poll_id): Path<PollId>,
    user: AuthUser,
) -> Result<StatusCode, ApiError> {
    voting.delete_poll(poll_id, user.id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Vote on a poll
pub async fn vote(
    State(voting): State<VotingService>,
    Path(poll_id): Path<PollId>,
    user: AuthUser,
    Json(vote_data): Json<VoteRequest>,
) -> Result<(StatusCode, Json<Vote>), ApiError> {
    let vote = voting
        .submit_vote(poll_id, user.id, vote_data.option_index)
        .await?;
    Ok((StatusCode::CREATED, Json(vote)))
}

/// Whether the caller has voted on the poll
pub async fn has_voted(
    State(voting): State<VotingService>,
    Path(poll_id): Path<PollId>,
    user: AuthUser,
) -> Result<Json<HasVotedResponse>, ApiError> {
    let has_voted = voting.has_voted(poll_id, user.id).await?;
    Ok(Json(HasVotedResponse { has_voted }))
}

/// Current results with option labels
pub async fn get_results(
    State(voting): State<VotingService>,
    Path(poll_id): Path<PollId>,
) -> Result<Json<PollResults>, ApiError> {
    Ok(Json(voting.poll_results(poll_id).await?))
}

/// Server-sent events: the current tally, then a fresh tally after every vote.
/// A failed recomputation sends an `error` event and closes the stream.
pub async fn stream_results(
    State(voting): State<VotingService>,
    Path(poll_id): Path<PollId>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = voting
        .subscribe_to_tally(poll_id, move |update| {
            let _ = tx.send(update);
        })
        .await?;
    // Taken after subscribing so no vote falls between the snapshot and the first update.
    let current = voting.compute_tally(poll_id).await?;
    debug!(%poll_id, "streaming results");

    let updates = stream::unfold(
        (rx, subscription, false),
        move |(mut rx, subscription, finished)| async move {
            if finished {
                return None;
            }
            let (event, finished) = match rx.recv().await? {
                Ok(tally) => (tally_event(poll_id, tally), false),
                Err(e) => (Event::default().event("error").data(e.to_string()), true),
            };
            Some((Ok::<_, Infallible>(event), (rx, subscription, finished)))
        },
    );

    let snapshot = stream::once(async move { Ok::<_, Infallible>(tally_event(poll_id, current)) });
    Ok(Sse::new(snapshot.chain(updates)).keep_alive(KeepAlive::default()))
}

fn tally_event(poll_id: PollId, tally: Tally) -> Event {
    Event::default()
        .event("tally")
        .json_data(TallyEvent { poll_id, tally })
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}
