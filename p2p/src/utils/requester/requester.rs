//! Requester for sending rate-limited requests to peers.

use super::{
    metrics::{Metrics, Status, StatusLabel},
    Config,
};
use governor::{
    clock::{Clock as _, DefaultClock},
    DefaultKeyedRateLimiter, RateLimiter,
};
use ocr_utils::PrioritySet;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::{
    collections::{HashMap, HashSet},
    fmt::Debug,
    hash::Hash,
    time::Duration,
};
use thiserror::Error;
use tokio::time::Instant;

/// Unique identifier for a request.
///
/// Once u64 requests have been made, the ID wraps around (resetting to zero).
/// As long as there are less than u64 requests outstanding, this should not be
/// an issue.
pub type ID = u64;

/// Errors that can occur when creating a request.
#[derive(Error, Debug, PartialEq)]
pub enum Error {
    #[error("no eligible participants")]
    NoEligibleParticipants,
    #[error("rate limited, retry after {0:?}")]
    RateLimited(Duration),
}

/// Send rate-limited requests to participants prioritized by performance.
///
/// Participants are scored by an exponential moving average of response time in
/// milliseconds (lower is better).
pub struct Requester<P: Ord + Hash + Clone + Debug> {
    me: Option<P>,
    metrics: Metrics,
    initial: Duration,
    timeout: Duration,
    rng: StdRng,

    // Participants excluded forever
    blocked: HashSet<P>,

    // Participants excluded until the given instant
    excluded: HashMap<P, Instant>,

    rate_limiter: DefaultKeyedRateLimiter<P>,
    clock: DefaultClock,
    participants: PrioritySet<P, u128>,

    id: ID,
    requests: HashMap<ID, (P, Instant)>,
    deadlines: PrioritySet<ID, Instant>,
}

/// Request returned by [Requester::handle] or [Requester::cancel].
#[derive(Debug)]
pub struct Request<P> {
    /// Unique identifier for the request.
    pub id: ID,

    /// Participant that handled the request.
    pub participant: P,

    start: Instant,
}

impl<P: Ord + Hash + Clone + Debug> Requester<P> {
    /// Create a new requester.
    pub fn new(config: Config<P>) -> Self {
        let metrics = Metrics::init(&config.registry, config.metrics_prefix);
        Self {
            me: config.me,
            metrics,
            initial: config.initial,
            timeout: config.timeout,
            rng: StdRng::seed_from_u64(config.seed),

            blocked: HashSet::new(),
            excluded: HashMap::new(),

            rate_limiter: RateLimiter::keyed(config.rate_limit),
            clock: DefaultClock::default(),
            participants: PrioritySet::new(),

            id: 0,
            requests: HashMap::new(),
            deadlines: PrioritySet::new(),
        }
    }

    /// Replace the set of participants, keeping the scores of those already known.
    pub fn reconcile(&mut self, participants: &[P]) {
        self.participants
            .reconcile(participants, self.initial.as_millis());
        self.rate_limiter.shrink_to_fit();
    }

    /// Never send requests to `participant` again.
    pub fn block(&mut self, participant: P) {
        self.blocked.insert(participant);
        self.metrics.excluded.set(self.len_excluded() as i64);
    }

    /// Skip `participant` until `duration` has elapsed.
    pub fn exclude(&mut self, participant: P, duration: Duration) {
        self.excluded.insert(participant, Instant::now() + duration);
        self.metrics.excluded.set(self.len_excluded() as i64);
    }

    /// Ask for a participant to handle a request.
    ///
    /// If `shuffle` is true, participants are tried in random order instead of by score.
    pub fn request(&mut self, shuffle: bool) -> Result<(P, ID), Error> {
        self.request_filtered(shuffle, |_| true)
    }

    /// Ask for a participant satisfying `filter` to handle a request.
    pub fn request_filtered(
        &mut self,
        shuffle: bool,
        filter: impl Fn(&P) -> bool,
    ) -> Result<(P, ID), Error> {
        let now = Instant::now();
        self.excluded.retain(|_, until| *until > now);

        let mut candidates: Vec<P> = self.participants.iter().map(|(p, _)| p.clone()).collect();
        if shuffle {
            candidates.shuffle(&mut self.rng);
        }

        let mut next = None;
        for participant in candidates {
            if Some(&participant) == self.me.as_ref() {
                continue;
            }
            if self.blocked.contains(&participant) || self.excluded.contains_key(&participant) {
                continue;
            }
            if !filter(&participant) {
                continue;
            }

            // Check rate limit last so that skipped participants do not consume quota
            if let Err(wait) = self.rate_limiter.check_key(&participant) {
                let wait = wait.wait_time_from(self.clock.now());
                next = Some(next.map_or(wait, |current: Duration| current.min(wait)));
                continue;
            }

            let id = self.id;
            self.id = self.id.wrapping_add(1);
            self.requests.insert(id, (participant.clone(), now));
            self.deadlines.put(id, now + self.timeout);

            self.metrics
                .created
                .get_or_create(&StatusLabel::new(Status::Success))
                .inc();
            return Ok((participant, id));
        }

        self.metrics
            .created
            .get_or_create(&StatusLabel::new(Status::Failure))
            .inc();
        next.map_or_else(
            || Err(Error::NoEligibleParticipants),
            |wait| Err(Error::RateLimited(wait)),
        )
    }

    fn update(&mut self, participant: P, elapsed: Duration) {
        let Some(past) = self.participants.get(&participant) else {
            return;
        };
        let next = past.saturating_add(elapsed.as_millis()) / 2;
        self.participants.put(participant, next);
    }

    /// Drop the request with `id` without scoring the participant.
    pub fn cancel(&mut self, id: ID) -> Option<Request<P>> {
        let (participant, start) = self.requests.remove(&id)?;
        self.deadlines.remove(&id);
        Some(Request {
            id,
            participant,
            start,
        })
    }

    /// Match a response from `participant` to the outstanding request `id`.
    ///
    /// Returns `None` if no such request exists or it was sent to another participant.
    pub fn handle(&mut self, participant: &P, id: ID) -> Option<Request<P>> {
        let (expected, _) = self.requests.get(&id)?;
        if expected != participant {
            return None;
        }
        self.cancel(id)
    }

    /// Score a request that produced a valid response.
    pub fn resolve(&mut self, request: Request<P>) {
        let elapsed = Instant::now().saturating_duration_since(request.start);
        self.update(request.participant, elapsed);
        self.metrics
            .requests
            .get_or_create(&StatusLabel::new(Status::Success))
            .inc();
    }

    /// Score a request that timed out.
    pub fn timeout(&mut self, request: Request<P>) {
        self.update(request.participant, self.timeout);
        self.metrics
            .requests
            .get_or_create(&StatusLabel::new(Status::Timeout))
            .inc();
    }

    /// Score a request that returned an unusable response.
    pub fn fail(&mut self, request: Request<P>) {
        self.update(request.participant, self.timeout);
        self.metrics
            .requests
            .get_or_create(&StatusLabel::new(Status::Failure))
            .inc();
    }

    /// The request with the earliest deadline.
    pub fn next(&self) -> Option<(ID, Instant)> {
        let (id, deadline) = self.deadlines.peek()?;
        Some((*id, *deadline))
    }

    /// Number of outstanding requests.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// Number of participants blocked or currently excluded.
    pub fn len_excluded(&self) -> usize {
        self.blocked.len() + self.excluded.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use governor::Quota;
    use prometheus_client::registry::Registry;
    use std::{
        num::NonZeroU32,
        sync::{Arc, Mutex},
    };

    fn config(me: Option<u32>, per_second: u32) -> Config<u32> {
        Config {
            me,
            rate_limit: Quota::per_second(NonZeroU32::new(per_second).unwrap()),
            initial: Duration::from_millis(100),
            timeout: Duration::from_secs(5),
            seed: 0,
            registry: Arc::new(Mutex::new(Registry::default())),
            metrics_prefix: "requester",
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_requester_basic() {
        let mut requester = Requester::new(config(Some(0), 1));

        // Request before any participants
        assert_eq!(requester.request(false), Err(Error::NoEligibleParticipants));
        assert_eq!(requester.len(), 0);
        assert_eq!(requester.next(), None);
        assert!(requester.handle(&0, 0).is_none());

        // Ourselves are never selected
        requester.reconcile(&[0, 1]);
        let start = Instant::now();
        let (participant, id) = requester.request(false).unwrap();
        assert_eq!((participant, id), (1, 0));
        let (next_id, deadline) = requester.next().unwrap();
        assert_eq!(next_id, 0);
        assert_eq!(deadline, start + Duration::from_secs(5));

        // Rate limited
        assert!(matches!(
            requester.request(false),
            Err(Error::RateLimited(_))
        ));

        // Wrong participant cannot resolve
        assert!(requester.handle(&0, id).is_none());
        let request = requester.handle(&1, id).unwrap();
        assert_eq!(request.id, id);
        requester.resolve(request);
        assert_eq!(requester.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requester_prefers_fast_participants() {
        let mut requester = Requester::new(config(None, 1_000));
        requester.reconcile(&[1, 2]);

        // Participant 1 times out, participant 2 answers quickly
        let (first, id) = requester.request(false).unwrap();
        let request = requester.cancel(id).unwrap();
        requester.timeout(request);
        let other = if first == 1 { 2 } else { 1 };
        let (participant, id) = requester.request_filtered(false, |p| *p == other).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let request = requester.handle(&participant, id).unwrap();
        requester.resolve(request);

        let (participant, _) = requester.request(false).unwrap();
        assert_eq!(participant, other);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requester_exclusion() {
        let mut requester = Requester::new(config(None, 1_000));
        requester.reconcile(&[1, 2]);

        requester.block(1);
        requester.exclude(2, Duration::from_secs(1));
        assert_eq!(requester.len_excluded(), 2);
        assert_eq!(requester.request(true), Err(Error::NoEligibleParticipants));

        // Exclusion expires, block does not
        tokio::time::sleep(Duration::from_secs(2)).await;
        let (participant, _) = requester.request(true).unwrap();
        assert_eq!(participant, 2);
        assert_eq!(requester.len_excluded(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requester_deadlines() {
        let mut requester = Requester::new(config(None, 1_000));
        requester.reconcile(&[1, 2, 3]);
        let (_, first) = requester.request(false).unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let (_, second) = requester.request(false).unwrap();
        assert_eq!(requester.next().unwrap().0, first);
        let request = requester.cancel(first).unwrap();
        requester.timeout(request);
        assert_eq!(requester.next().unwrap().0, second);
    }
}
