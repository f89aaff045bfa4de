//! Per-request search pipeline
//!
//! Each request walks a bounded state machine:
//!
//! ```text
//! Leasing{1} ──lease SEARCH+PROXY──► fetch ──► verdict
//!     ▲                                         │
//!     └──── key penalized, attempt+1 ◄──────────┤ retryable
//!                                               ├──► Done(outcome)   settled
//!                                               └──► Failed(error)   terminal
//! ```
//!
//! Before the first lease the user is admitted against their daily limit; the
//! admission is held until the request is settled. Pool exhaustion and store
//! integrity failures are terminal. Everything the provider chain can do
//! wrong costs one key and one attempt.

use std::sync::Arc;
use std::time::Instant;

use key_pool::{KeyPool, LeasedKey, Outcome, QuotaLedger, Settlement};
use key_store::KeyKind;
use provider::{FetchRequest, Payload, SearchBackend, SearchMatch, classify_payload};
use tracing::{debug, info, warn};

use crate::error::SearchError;
use crate::metrics;

/// Immutable context for one search, passed by reference through every stage.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub request_id: String,
    pub user_id: String,
    pub image_url: String,
}

/// Successful result of a search.
#[derive(Debug, Clone)]
pub enum SearchOutcome {
    Match {
        top: Box<SearchMatch>,
        /// SEARCH quota left on the key that served the request, as reported
        /// by the provider when it says
        remaining: u32,
    },
    NoMatch {
        remaining: u32,
    },
}

impl SearchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            SearchOutcome::Match { .. } => "match",
            SearchOutcome::NoMatch { .. } => "no_match",
        }
    }

    pub fn remaining(&self) -> u32 {
        match self {
            SearchOutcome::Match { remaining, .. } | SearchOutcome::NoMatch { remaining } => {
                *remaining
            }
        }
    }
}

enum State {
    Leasing { attempt: u32 },
    Done(SearchOutcome),
    Failed(SearchError),
}

/// What one provider call means for the leased keys.
enum Verdict {
    Found {
        top: Box<SearchMatch>,
        remaining: Option<i64>,
    },
    Empty {
        remaining: Option<i64>,
    },
    /// Charge `outcome` to the key of `kind` and retry.
    Penalize {
        kind: KeyKind,
        outcome: Outcome,
        detail: String,
    },
}

pub struct Orchestrator {
    pool: Arc<KeyPool>,
    ledger: Arc<QuotaLedger>,
    backend: Arc<dyn SearchBackend>,
    max_attempts: u32,
    daily_limit: u32,
}

impl Orchestrator {
    pub fn new(
        pool: Arc<KeyPool>,
        ledger: Arc<QuotaLedger>,
        backend: Arc<dyn SearchBackend>,
        max_attempts: u32,
        daily_limit: u32,
    ) -> Self {
        Self {
            pool,
            ledger,
            backend,
            max_attempts,
            daily_limit,
        }
    }

    /// Run one search to completion.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchOutcome, SearchError> {
        let start = Instant::now();

        let result = match self.pool.admit(&request.user_id, self.daily_limit).await {
            Ok(admission) => {
                debug!(
                    request_id = %request.request_id,
                    status = %admission.status,
                    left_today = ?admission.left_today(),
                    "user admitted"
                );
                let result = self.run(request).await;
                drop(admission);
                result
            }
            Err(err) => {
                info!(
                    request_id = %request.request_id,
                    user_id = %request.user_id,
                    error = %err,
                    "search refused"
                );
                Err(err.into())
            }
        };

        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(err) => err.label(),
        };
        metrics::record_search(label, start.elapsed().as_secs_f64());
        result
    }

    async fn run(&self, request: &SearchRequest) -> Result<SearchOutcome, SearchError> {
        let mut state = State::Leasing { attempt: 1 };

        loop {
            state = match state {
                State::Leasing { attempt } if attempt > self.max_attempts => {
                    warn!(
                        request_id = %request.request_id,
                        attempts = self.max_attempts,
                        "all attempts exhausted"
                    );
                    State::Failed(SearchError::AllAttemptsExhausted {
                        attempts: self.max_attempts,
                    })
                }
                State::Leasing { attempt } => self.attempt(request, attempt).await,
                State::Done(outcome) => break Ok(outcome),
                State::Failed(err) => break Err(err),
            };
        }
    }

    async fn attempt(&self, request: &SearchRequest, attempt: u32) -> State {
        let search_key = match self.lease(KeyKind::Search).await {
            Ok(key) => key,
            Err(err) => return State::Failed(err),
        };
        let proxy_key = match self.lease(KeyKind::Proxy).await {
            Ok(key) => key,
            Err(err) => return State::Failed(err),
        };

        debug!(
            request_id = %request.request_id,
            attempt,
            search_key = %search_key.id,
            proxy_key = %proxy_key.id,
            backend = self.backend.id(),
            "calling provider"
        );

        let fetched = self
            .backend
            .fetch(FetchRequest {
                image_url: &request.image_url,
                search_key: &search_key.secret,
                proxy_key: &proxy_key.secret,
            })
            .await;

        match verdict(fetched) {
            Verdict::Found { top, remaining } => {
                metrics::record_attempt("match");
                match self.settle(request, &search_key, &proxy_key, remaining).await {
                    Ok(remaining) => {
                        info!(request_id = %request.request_id, attempt, remaining, "match found");
                        State::Done(SearchOutcome::Match { top, remaining })
                    }
                    Err(err) => State::Failed(err),
                }
            }
            Verdict::Empty { remaining } => {
                metrics::record_attempt("no_match");
                match self.settle(request, &search_key, &proxy_key, remaining).await {
                    Ok(remaining) => {
                        info!(request_id = %request.request_id, attempt, remaining, "no match");
                        State::Done(SearchOutcome::NoMatch { remaining })
                    }
                    Err(err) => State::Failed(err),
                }
            }
            Verdict::Penalize {
                kind,
                outcome,
                detail,
            } => {
                let key_id = match kind {
                    KeyKind::Search => &search_key.id,
                    KeyKind::Proxy => &proxy_key.id,
                };
                metrics::record_attempt(outcome.label());
                warn!(
                    request_id = %request.request_id,
                    attempt,
                    key_id = %key_id,
                    kind = %kind,
                    cause = outcome.label(),
                    detail = %detail,
                    "attempt failed, penalizing key"
                );
                match self.ledger.commit(key_id, kind, outcome).await {
                    Ok(_) => State::Leasing {
                        attempt: attempt + 1,
                    },
                    Err(err) => State::Failed(err.into()),
                }
            }
        }
    }

    async fn lease(&self, kind: KeyKind) -> Result<LeasedKey, SearchError> {
        match self.pool.lease(kind).await? {
            Some(key) => Ok(key),
            None => {
                warn!(kind = %kind, "key pool exhausted");
                Err(SearchError::PoolExhausted(kind))
            }
        }
    }

    /// Record a successful call against both keys. Returns the remaining
    /// SEARCH quota the provider reported, or the stored quota when it did
    /// not report one.
    async fn settle(
        &self,
        request: &SearchRequest,
        search_key: &LeasedKey,
        proxy_key: &LeasedKey,
        remaining: Option<i64>,
    ) -> Result<u32, SearchError> {
        let entries = [
            Settlement {
                key_id: &search_key.id,
                kind: KeyKind::Search,
                outcome: Outcome::Completed { remaining },
            },
            Settlement {
                key_id: &proxy_key.id,
                kind: KeyKind::Proxy,
                outcome: Outcome::Completed { remaining: None },
            },
        ];
        let settled = self.ledger.settle(&request.user_id, &entries).await?;
        if let Some(reported) = remaining {
            return Ok(u32::try_from(reported.max(0)).unwrap_or(u32::MAX));
        }
        Ok(settled
            .iter()
            .find(|key| key.kind == KeyKind::Search)
            .map_or(search_key.quota_remaining, |key| key.quota_remaining))
    }
}

fn verdict(fetched: Result<String, provider::FetchError>) -> Verdict {
    let body = match fetched {
        Ok(body) => body,
        Err(err) => {
            let classification = key_pool::classify_fetch_error(&err);
            let (kind, outcome) = key_pool::penalty(classification);
            return Verdict::Penalize {
                kind,
                outcome,
                detail: err.to_string(),
            };
        }
    };

    match classify_payload(&body) {
        Payload::Matches { remaining, top } => Verdict::Found { top, remaining },
        Payload::Empty { remaining } => Verdict::Empty { remaining },
        Payload::Unstructured { snippet } => Verdict::Penalize {
            kind: KeyKind::Search,
            outcome: Outcome::Rejected {
                cause: "unstructured",
            },
            detail: snippet,
        },
        Payload::ProviderError {
            status, message, ..
        } => Verdict::Penalize {
            kind: KeyKind::Search,
            outcome: Outcome::Rejected {
                cause: "provider_error",
            },
            detail: match status {
                Some(code) => format!("status {code}: {message}"),
                None => message,
            },
        },
    }
}
