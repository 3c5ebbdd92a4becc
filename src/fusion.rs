use crate::indicators::{IndicatorError, IndicatorService};
use crate::proximity::ProximityAggregator;
use crate::repository::MunicipalityRepository;
use crate::types::{IndicatorKey, IndicatorSet, MetricsSnapshot};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SelectionTicket {
    pub code: Option<String>,
    pub generation: u64,
}

/// The municipality currently under analysis. Every change bumps the
/// generation, which is how late results from an older selection are
/// recognised and dropped.
pub struct Selection {
    current: watch::Sender<SelectionTicket>,
}

impl Default for Selection {
    fn default() -> Self {
        Self::new()
    }
}

impl Selection {
    pub fn new() -> Self {
        let (current, _) = watch::channel(SelectionTicket { code: None, generation: 0 });
        Self { current }
    }

    pub fn current(&self) -> SelectionTicket {
        self.current.borrow().clone()
    }

    pub fn generation(&self) -> u64 {
        self.current.borrow().generation
    }

    fn advance(&self, code: Option<String>) -> SelectionTicket {
        self.current.send_modify(|ticket| {
            ticket.generation += 1;
            ticket.code = code;
        });
        self.current()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum FusionState {
    Idle,
    Loading {
        code: String,
        generation: u64,
    },
    /// A new selection arrived while `superseded` was still in flight.
    Stale {
        superseded: u64,
        generation: u64,
    },
    Ready {
        snapshot: MetricsSnapshot,
    },
    /// Degraded: the snapshot holds whatever did succeed.
    Failed {
        snapshot: MetricsSnapshot,
        errors: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FusionOutcome {
    Ready(MetricsSnapshot),
    Failed { snapshot: MetricsSnapshot, errors: Vec<String> },
    /// A newer selection took over; nothing was published.
    Superseded { generation: u64, current: u64 },
}

/// Merges static hazard attributes, demographic indicators and proximity
/// metrics for the selected municipality and publishes the result.
pub struct FusionService {
    repository: Arc<MunicipalityRepository>,
    indicators: Arc<dyn IndicatorService>,
    aggregator: ProximityAggregator,
    selection: Arc<Selection>,
    state: watch::Sender<FusionState>,
    /// Generation of the cycle started by `fuse` and not yet settled; 0 when
    /// none. Only touched under the state lock.
    in_flight: AtomicU64,
    categories: Vec<String>,
    indicator_keys: Vec<IndicatorKey>,
    indicator_timeout: Option<Duration>,
}

impl FusionService {
    pub fn new(
        repository: Arc<MunicipalityRepository>,
        indicators: Arc<dyn IndicatorService>,
        aggregator: ProximityAggregator,
    ) -> Self {
        let (state, _) = watch::channel(FusionState::Idle);
        Self {
            repository,
            indicators,
            aggregator,
            selection: Arc::new(Selection::new()),
            state,
            in_flight: AtomicU64::new(0),
            categories: vec!["hospital".into(), "police".into(), "fire".into()],
            indicator_keys: IndicatorKey::ALL.to_vec(),
            indicator_timeout: None,
        }
    }

    pub fn with_categories(mut self, categories: Vec<String>) -> Self {
        self.categories = categories;
        self
    }

    pub fn with_indicator_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.indicator_timeout = timeout;
        self
    }

    pub fn repository(&self) -> &MunicipalityRepository {
        &self.repository
    }

    pub fn selection(&self) -> Arc<Selection> {
        self.selection.clone()
    }

    pub fn state(&self) -> FusionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FusionState> {
        self.state.subscribe()
    }

    /// Makes `code` the current selection. If a fusion is in flight the
    /// state turns `Stale` until that cycle settles or the new one starts;
    /// otherwise it goes straight to `Loading`.
    pub fn select(&self, code: impl Into<String>) -> SelectionTicket {
        let code = code.into();
        let mut issued = None;
        // Generation changes only under the state lock, so a completing
        // fusion always compares against a settled generation.
        self.state.send_modify(|state| {
            let ticket = self.selection.advance(Some(code.clone()));
            let next = match self.in_flight.load(Ordering::Relaxed) {
                0 => FusionState::Loading {
                    code: code.clone(),
                    generation: ticket.generation,
                },
                superseded => FusionState::Stale {
                    superseded,
                    generation: ticket.generation,
                },
            };
            *state = next;
            issued = Some(ticket);
        });
        let ticket = issued.unwrap_or_else(|| self.selection.current());
        info!(code = %code, generation = ticket.generation, "Selection changed");
        ticket
    }

    /// Drops the selection. In-flight results will be discarded.
    pub fn clear(&self) {
        self.state.send_modify(|state| {
            self.selection.advance(None);
            *state = FusionState::Idle;
        });
    }

    pub async fn select_and_fuse(&self, code: impl Into<String>) -> FusionOutcome {
        let ticket = self.select(code);
        self.fuse(ticket).await
    }

    /// Runs one fusion cycle for `ticket`. The indicator request and the
    /// proximity searches run concurrently; the result is published only if
    /// `ticket` is still the current selection when both have settled.
    pub async fn fuse(&self, ticket: SelectionTicket) -> FusionOutcome {
        let generation = ticket.generation;
        let Some(code) = ticket.code else {
            return self.superseded(generation);
        };

        let started = self.state.send_if_modified(|state| {
            if self.selection.generation() != generation {
                return false;
            }
            *state = FusionState::Loading { code: code.clone(), generation };
            self.in_flight.store(generation, Ordering::Relaxed);
            true
        });
        if !started {
            return self.superseded(generation);
        }

        let municipality = match self.repository.get(&code) {
            Ok(municipality) => municipality,
            Err(err) => {
                warn!(code = %code, error = %err, "Selected municipality is not loaded");
                let snapshot = MetricsSnapshot::unavailable(generation, code);
                return self.publish(snapshot, vec![err.to_string()]);
            }
        };

        let (indicators, proximity) = tokio::join!(
            self.fetch_indicators(&code),
            self.aggregator.aggregate(municipality, &self.categories)
        );

        let mut errors = Vec::new();
        let mut snapshot = MetricsSnapshot {
            generation,
            code: code.clone(),
            name: Some(municipality.name.clone()),
            region: municipality.region.clone(),
            hazard: Some(municipality.hazard.clone()),
            indicators: None,
            proximity: None,
            failed_categories: Vec::new(),
        };

        match indicators {
            Ok(set) => snapshot.indicators = Some(set),
            Err(err) => {
                warn!(code = %code, error = %err, "Indicator request failed");
                errors.push(err.to_string());
            }
        }

        if proximity.all_failed() {
            errors.push(format!("all {} proximity searches failed", proximity.failed.len()));
        } else {
            snapshot.proximity = Some(proximity.metrics);
        }
        snapshot.failed_categories = proximity.failed;

        self.publish(snapshot, errors)
    }

    async fn fetch_indicators(&self, code: &str) -> Result<IndicatorSet, IndicatorError> {
        let request = self.indicators.fetch(code, &self.indicator_keys);
        match self.indicator_timeout {
            Some(timeout) => tokio::time::timeout(timeout, request)
                .await
                .map_err(|_| IndicatorError::Timeout(timeout))?,
            None => request.await,
        }
    }

    fn publish(&self, snapshot: MetricsSnapshot, errors: Vec<String>) -> FusionOutcome {
        let generation = snapshot.generation;
        let next = if errors.is_empty() {
            FusionState::Ready { snapshot: snapshot.clone() }
        } else {
            FusionState::Failed { snapshot: snapshot.clone(), errors: errors.clone() }
        };

        let published = self.state.send_if_modified(|state| {
            if self.selection.generation() != generation {
                return false;
            }
            *state = next;
            let _ = self.in_flight.compare_exchange(generation, 0, Ordering::Relaxed, Ordering::Relaxed);
            true
        });

        if !published {
            self.retire(generation);
            return self.superseded(generation);
        }

        if errors.is_empty() {
            info!(code = %snapshot.code, generation, "Snapshot ready");
            FusionOutcome::Ready(snapshot)
        } else {
            warn!(code = %snapshot.code, generation, ?errors, "Snapshot degraded");
            FusionOutcome::Failed { snapshot, errors }
        }
    }

    /// Settles a cycle that lost its selection. A `Stale` state waiting on it
    /// falls back to `Loading` for the current selection.
    fn retire(&self, generation: u64) {
        self.state.send_if_modified(|state| {
            if self.in_flight.compare_exchange(generation, 0, Ordering::Relaxed, Ordering::Relaxed).is_err() {
                return false;
            }
            let waiting = matches!(&*state, FusionState::Stale { superseded, .. } if *superseded == generation);
            let current = self.selection.current();
            match current.code {
                Some(code) if waiting => {
                    *state = FusionState::Loading { code, generation: current.generation };
                    true
                }
                _ => false,
            }
        });
    }

    fn superseded(&self, generation: u64) -> FusionOutcome {
        let current = self.selection.generation();
        debug!(generation, current, "Discarding stale fusion result");
        FusionOutcome::Superseded { generation, current }
    }
}
