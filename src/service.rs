// src/service.rs
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{PollError, PollResult, StoreError};
use crate::fanout::{EventKind, Fanout, PollEvent, Subscription};
use crate::lifecycle;
use crate::models::{NewPoll, OptionId, Poll, PollId, PollSummary, PollView, Tally};
use crate::results::{self, PollResults};
use crate::store::PollStore;

/// How often a vote that lost a storage race is tried again.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 2,
            backoff: Duration::from_millis(25),
        }
    }
}

impl NewPoll {
    /// Trims the question and options and drops blank options. Durations of
    /// zero or less mean the poll never expires; fractional minutes are kept to
    /// the millisecond.
    pub fn validate(
        question: &str,
        options: &[String],
        duration_minutes: Option<f64>,
        now: DateTime<Utc>,
    ) -> PollResult<Self> {
        let question = question.trim();
        if question.is_empty() {
            return Err(PollError::Validation("Question is required".to_string()));
        }

        let options: Vec<String> = options
            .iter()
            .map(|o| o.trim())
            .filter(|o| !o.is_empty())
            .map(str::to_string)
            .collect();
        if options.len() < 2 {
            return Err(PollError::Validation(
                "Question and at least 2 options required".to_string(),
            ));
        }

        let expires_at = match duration_minutes {
            Some(minutes) if minutes > 0.0 => {
                let millis = (minutes * 60_000.0).round();
                let expires_at = (millis.is_finite() && millis < i64::MAX as f64)
                    .then(|| chrono::Duration::try_milliseconds(millis as i64))
                    .flatten()
                    .and_then(|d| now.checked_add_signed(d))
                    .ok_or_else(|| PollError::Validation("Duration is too large".to_string()))?;
                Some(expires_at)
            }
            _ => None,
        };

        Ok(Self {
            question: question.to_string(),
            options,
            expires_at,
        })
    }
}

/// Vote admission, lifecycle and result projection over a `PollStore`, with
/// change events pushed through a `Fanout`.
#[derive(Clone)]
pub struct PollService {
    store: Arc<dyn PollStore>,
    fanout: Arc<Fanout>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
}

impl PollService {
    pub fn new(store: Arc<dyn PollStore>, fanout: Arc<Fanout>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            fanout,
            clock,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    pub async fn create_poll(
        &self,
        question: &str,
        options: &[String],
        duration_minutes: Option<f64>,
    ) -> PollResult<Poll> {
        let new_poll = NewPoll::validate(question, options, duration_minutes, self.clock.now())?;
        let poll = self.store.create(new_poll).await?;

        info!(poll_id = %poll.id, options = poll.options.len(), expires_at = ?poll.expires_at, "poll created");
        Ok(poll)
    }

    pub async fn get_poll(&self, poll_id: PollId) -> PollResult<PollView> {
        let poll = self.store.get(poll_id).await?;
        let now = self.clock.now();

        Ok(PollView {
            id: poll.id,
            is_expired: lifecycle::is_expired(&poll, now),
            is_open: lifecycle::is_open(&poll, now),
            total_votes: poll.total_votes(),
            question: poll.question,
            options: poll.options,
            created_at: poll.created_at,
            expires_at: poll.expires_at,
            terminated: poll.terminated,
        })
    }

    pub async fn list_active(&self) -> PollResult<Vec<PollSummary>> {
        Ok(self.store.list_active().await?)
    }

    pub async fn get_results(&self, poll_id: PollId) -> PollResult<PollResults> {
        let poll = self.store.get(poll_id).await?;
        let is_open = lifecycle::is_open(&poll, self.clock.now());
        Ok(results::project(&poll, is_open))
    }

    /// Admits one vote. Checks run in order: poll exists, poll is open, option
    /// belongs to the poll, identity has not voted. The store repeats the
    /// checks atomically when applying, so the early ones only shortcut.
    pub async fn submit_vote(
        &self,
        poll_id: PollId,
        option_id: OptionId,
        identity: &str,
    ) -> PollResult<Tally> {
        let poll = self.store.get(poll_id).await?;

        if let Some(reason) = lifecycle::closed_reason(&poll, self.clock.now()) {
            return Err(PollError::Closed(reason));
        }
        if poll.option(option_id).is_none() {
            return Err(PollError::OptionNotFound);
        }
        if poll.has_voted(identity) {
            return Err(PollError::AlreadyVoted);
        }

        let tally = match self.store.apply_vote(poll_id, option_id, identity).await {
            Ok(tally) => tally,
            Err(StoreError::Conflict) => {
                let latest = self.store.get(poll_id).await?;
                if latest.has_voted(identity) {
                    return Err(PollError::AlreadyVoted);
                }
                warn!(%poll_id, "vote lost a storage race");
                return Err(PollError::StorageConflict);
            }
            Err(err) => return Err(err.into()),
        };

        debug!(%poll_id, %option_id, total_votes = tally.total_votes, "vote admitted");

        let is_open = lifecycle::is_open(&poll, self.clock.now());
        self.fanout.publish(PollEvent {
            kind: EventKind::Vote,
            revision: tally.revision,
            results: results::project_tally(&poll.question, &tally, is_open),
        });

        Ok(tally)
    }

    /// `submit_vote`, repeated with linear backoff while it reports
    /// `StorageConflict`.
    pub async fn submit_vote_with_retry(
        &self,
        poll_id: PollId,
        option_id: OptionId,
        identity: &str,
    ) -> PollResult<Tally> {
        let mut attempt = 0;
        loop {
            match self.submit_vote(poll_id, option_id, identity).await {
                Err(PollError::StorageConflict) if attempt < self.retry.retries => {
                    attempt += 1;
                    tokio::time::sleep(self.retry.backoff * attempt).await;
                }
                other => return other,
            }
        }
    }

    pub async fn terminate(&self, poll_id: PollId) -> PollResult<()> {
        let termination = self.store.terminate(poll_id).await?;

        if termination.changed {
            info!(%poll_id, total_votes = termination.poll.total_votes(), "poll terminated");
            self.fanout.publish(PollEvent {
                kind: EventKind::Terminated,
                revision: termination.poll.revision,
                results: results::project(&termination.poll, false),
            });
        }

        Ok(())
    }

    /// Subscribes to a poll and returns a snapshot of its current results.
    /// Events already reflected in the snapshot are not delivered again.
    pub async fn subscribe(&self, poll_id: PollId) -> PollResult<(PollEvent, Subscription)> {
        let mut subscription = self.fanout.subscribe(poll_id);
        let poll = self.store.get(poll_id).await?;
        let is_open = lifecycle::is_open(&poll, self.clock.now());

        subscription.skip_through(poll.revision);
        let snapshot = PollEvent {
            kind: EventKind::Snapshot,
            revision: poll.revision,
            results: results::project(&poll, is_open),
        };

        Ok((snapshot, subscription))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::lifecycle::ClosedReason;
    use crate::store::MemoryStore;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn service() -> (PollService, ManualClock) {
        let clock = ManualClock::default();
        let clock_arc: Arc<dyn Clock> = Arc::new(clock.clone());
        let store = Arc::new(MemoryStore::new(clock_arc.clone()));
        let service = PollService::new(store, Arc::new(Fanout::new(16)), clock_arc);
        (service, clock)
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn create_rejects_bad_input() {
        let (service, _) = service();

        let err = service.create_poll("   ", &strings(&["a", "b"]), None).await.unwrap_err();
        assert!(matches!(err, PollError::Validation(_)));

        let err = service
            .create_poll("Q?", &strings(&["a", "  ", ""]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Validation(_)));

        let err = service
            .create_poll("Q?", &strings(&["a", "b"]), Some(f64::MAX))
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Validation(_)));
    }

    #[tokio::test]
    async fn create_trims_and_sets_expiry() {
        let (service, clock) = service();
        let poll = service
            .create_poll("  Lunch?  ", &strings(&[" Pizza ", "", "Sushi"]), Some(30.0))
            .await
            .unwrap();

        assert_eq!(poll.question, "Lunch?");
        let texts: Vec<_> = poll.options.iter().map(|o| o.text.as_str()).collect();
        assert_eq!(texts, vec!["Pizza", "Sushi"]);
        assert_eq!(poll.expires_at, Some(clock.now() + ChronoDuration::minutes(30)));

        let poll = service
            .create_poll("Q?", &strings(&["a", "b"]), Some(0.0))
            .await
            .unwrap();
        assert_eq!(poll.expires_at, None);

        let poll = service
            .create_poll("Q?", &strings(&["a", "b"]), Some(1.5))
            .await
            .unwrap();
        assert_eq!(poll.expires_at, Some(clock.now() + ChronoDuration::seconds(90)));

        let poll = service
            .create_poll("Q?", &strings(&["a", "b"]), Some(-5.0))
            .await
            .unwrap();
        assert_eq!(poll.expires_at, None);
    }

    #[tokio::test]
    async fn coffee_or_tea_results() {
        let (service, _) = service();
        let poll = service
            .create_poll("Coffee or Tea?", &strings(&["Coffee", "Tea"]), None)
            .await
            .unwrap();
        let (coffee, tea) = (poll.options[0].id, poll.options[1].id);

        let empty = service.get_results(poll.id).await.unwrap();
        assert_eq!(empty.total_votes, 0);
        assert!(empty.options.iter().all(|o| o.percentage == 0));

        service.submit_vote(poll.id, coffee, "A").await.unwrap();
        service.submit_vote(poll.id, coffee, "B").await.unwrap();
        service.submit_vote(poll.id, tea, "C").await.unwrap();

        let results = service.get_results(poll.id).await.unwrap();
        assert_eq!(results.question, "Coffee or Tea?");
        assert_eq!(results.total_votes, 3);
        assert_eq!((results.options[0].votes, results.options[0].percentage), (2, 67));
        assert_eq!((results.options[1].votes, results.options[1].percentage), (1, 33));
    }

    #[tokio::test]
    async fn second_vote_from_same_identity_is_rejected() {
        let (service, _) = service();
        let poll = service
            .create_poll("Coffee or Tea?", &strings(&["Coffee", "Tea"]), None)
            .await
            .unwrap();

        let first = service.submit_vote(poll.id, poll.options[0].id, "A").await.unwrap();
        let err = service
            .submit_vote(poll.id, poll.options[1].id, "A")
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::AlreadyVoted));

        let view = service.get_poll(poll.id).await.unwrap();
        assert_eq!(view.options, first.options);
        assert_eq!(view.total_votes, 1);
    }

    #[tokio::test]
    async fn errors_follow_precedence() {
        let (service, _) = service();
        let poll = service
            .create_poll("Q?", &strings(&["a", "b"]), None)
            .await
            .unwrap();
        service.submit_vote(poll.id, poll.options[0].id, "A").await.unwrap();

        let err = service
            .submit_vote(PollId::new(), OptionId::new(), "A")
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::NotFound));

        // unknown option wins over duplicate identity
        let err = service
            .submit_vote(poll.id, OptionId::new(), "A")
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::OptionNotFound));

        // closed wins over unknown option
        service.terminate(poll.id).await.unwrap();
        let err = service
            .submit_vote(poll.id, OptionId::new(), "A")
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Closed(ClosedReason::Terminated)));
    }

    #[tokio::test]
    async fn expired_poll_rejects_votes_without_termination() {
        let (service, clock) = service();
        let poll = service
            .create_poll("Q?", &strings(&["a", "b"]), Some(1.0))
            .await
            .unwrap();

        clock.advance(ChronoDuration::seconds(61));
        let err = service
            .submit_vote(poll.id, poll.options[0].id, "A")
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Closed(ClosedReason::Expired)));

        let view = service.get_poll(poll.id).await.unwrap();
        assert!(!view.terminated);
        assert!(view.is_expired);
        assert!(!view.is_open);
    }

    #[tokio::test]
    async fn terminated_results_stay_frozen() {
        let (service, _) = service();
        let poll = service
            .create_poll("Q?", &strings(&["a", "b"]), None)
            .await
            .unwrap();
        service.submit_vote(poll.id, poll.options[1].id, "A").await.unwrap();
        service.terminate(poll.id).await.unwrap();
        service.terminate(poll.id).await.unwrap();

        let err = service
            .submit_vote(poll.id, poll.options[0].id, "B")
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::Closed(ClosedReason::Terminated)));

        let results = service.get_results(poll.id).await.unwrap();
        assert!(results.terminated);
        assert!(!results.is_open);
        assert_eq!(results.total_votes, 1);
        assert_eq!(results.options[1].percentage, 100);

        assert!(matches!(
            service.terminate(PollId::new()).await.unwrap_err(),
            PollError::NotFound
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_distinct_identities_all_count() {
        let (service, _) = service();
        let poll = service
            .create_poll("Q?", &strings(&["a", "b", "c"]), None)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..200 {
            let service = service.clone();
            let option_id = poll.options[i % 3].id;
            let identity = format!("10.0.{}.{}", i / 256, i % 256);
            handles.push(tokio::spawn(async move {
                service.submit_vote(poll.id, option_id, &identity).await
            }));
        }
        let mut admitted = 0u64;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                admitted += 1;
            }
        }

        let stored = service.store.get(poll.id).await.unwrap();
        let sum: u64 = stored.options.iter().map(|o| o.votes).sum();
        assert_eq!(admitted, 200);
        assert_eq!(sum, admitted);
        assert_eq!(stored.total_votes(), admitted);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_same_identity_admits_exactly_one() {
        let (service, _) = service();
        let poll = service
            .create_poll("Q?", &strings(&["a", "b"]), None)
            .await
            .unwrap();

        let mut handles = Vec::new();
        for i in 0..32 {
            let service = service.clone();
            let option_id = poll.options[i % 2].id;
            handles.push(tokio::spawn(async move {
                service.submit_vote(poll.id, option_id, "198.51.100.4").await
            }));
        }

        let mut admitted = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => admitted += 1,
                Err(PollError::AlreadyVoted) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(service.get_results(poll.id).await.unwrap().total_votes, 1);
    }

    #[tokio::test]
    async fn subscribers_see_votes_and_termination_in_order() {
        let (service, _) = service();
        let poll = service
            .create_poll("Q?", &strings(&["a", "b"]), None)
            .await
            .unwrap();
        let other = service
            .create_poll("Other?", &strings(&["x", "y"]), None)
            .await
            .unwrap();

        let (snapshot, mut sub) = service.subscribe(poll.id).await.unwrap();
        let (_, mut other_sub) = service.subscribe(other.id).await.unwrap();
        assert_eq!(snapshot.kind, EventKind::Snapshot);
        assert_eq!(snapshot.results.total_votes, 0);

        service.submit_vote(poll.id, poll.options[0].id, "A").await.unwrap();
        service.submit_vote(poll.id, poll.options[1].id, "B").await.unwrap();
        service.terminate(poll.id).await.unwrap();

        let first = sub.recv().await.unwrap();
        assert_eq!((first.kind, first.results.total_votes), (EventKind::Vote, 1));
        let second = sub.recv().await.unwrap();
        assert_eq!((second.kind, second.results.total_votes), (EventKind::Vote, 2));
        let third = sub.recv().await.unwrap();
        assert_eq!(third.kind, EventKind::Terminated);
        assert!(third.results.terminated);

        assert_eq!(service.fanout().publish(PollEvent { revision: 0, ..third }), 0);
        drop(sub);
        assert_eq!(service.fanout().subscriber_count(other.id), 1);
        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), other_sub.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn unknown_poll_subscriptions_leave_no_channel() {
        let (service, _) = service();

        for _ in 0..1000 {
            let err = service.subscribe(PollId::new()).await.unwrap_err();
            assert!(matches!(err, PollError::NotFound));
        }
        assert_eq!(service.fanout().channel_count(), 0);
    }

    #[tokio::test]
    async fn leaving_an_expired_poll_releases_its_channel() {
        let (service, clock) = service();
        let poll = service
            .create_poll("Q?", &strings(&["a", "b"]), Some(1.0))
            .await
            .unwrap();
        clock.advance(ChronoDuration::seconds(61));

        let (snapshot, sub) = service.subscribe(poll.id).await.unwrap();
        assert!(!snapshot.results.is_open);
        assert_eq!(service.fanout().channel_count(), 1);

        drop(sub);
        assert_eq!(service.fanout().channel_count(), 0);
    }

    #[tokio::test]
    async fn vote_event_reports_poll_open() {
        let (service, _) = service();
        let poll = service
            .create_poll("Q?", &strings(&["a", "b"]), Some(10.0))
            .await
            .unwrap();
        let (_, mut sub) = service.subscribe(poll.id).await.unwrap();

        service.submit_vote(poll.id, poll.options[0].id, "A").await.unwrap();
        let event = sub.recv().await.unwrap();
        assert!(event.results.is_open);
        assert!(!event.results.terminated);
    }

    #[tokio::test]
    async fn rejected_votes_publish_nothing() {
        let (service, _) = service();
        let poll = service
            .create_poll("Q?", &strings(&["a", "b"]), None)
            .await
            .unwrap();
        service.submit_vote(poll.id, poll.options[0].id, "A").await.unwrap();

        let (snapshot, mut sub) = service.subscribe(poll.id).await.unwrap();
        assert_eq!(snapshot.revision, 1);
        assert!(service.submit_vote(poll.id, poll.options[0].id, "A").await.is_err());
        assert!(service.submit_vote(poll.id, OptionId::new(), "B").await.is_err());

        assert!(tokio::time::timeout(std::time::Duration::from_millis(20), sub.recv())
            .await
            .is_err());
    }

    /// Loses every apply to a pretend concurrent writer.
    struct RacingStore {
        inner: MemoryStore,
        winner: Option<String>,
        applies: AtomicUsize,
    }

    #[async_trait]
    impl PollStore for RacingStore {
        async fn create(&self, new_poll: NewPoll) -> Result<Poll, StoreError> {
            self.inner.create(new_poll).await
        }

        async fn get(&self, poll_id: PollId) -> Result<Poll, StoreError> {
            self.inner.get(poll_id).await
        }

        async fn apply_vote(
            &self,
            poll_id: PollId,
            option_id: OptionId,
            _identity: &str,
        ) -> Result<Tally, StoreError> {
            self.applies.fetch_add(1, Ordering::SeqCst);
            if let Some(winner) = &self.winner {
                let _ = self.inner.apply_vote(poll_id, option_id, winner).await;
            }
            Err(StoreError::Conflict)
        }

        async fn terminate(&self, poll_id: PollId) -> Result<crate::store::Termination, StoreError> {
            self.inner.terminate(poll_id).await
        }

        async fn list_active(&self) -> Result<Vec<PollSummary>, StoreError> {
            self.inner.list_active().await
        }
    }

    fn racing_service(winner: Option<&str>) -> (PollService, Arc<RacingStore>) {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::default());
        let store = Arc::new(RacingStore {
            inner: MemoryStore::new(clock.clone()),
            winner: winner.map(str::to_string),
            applies: AtomicUsize::new(0),
        });
        let service = PollService::new(store.clone(), Arc::new(Fanout::new(4)), clock)
            .with_retry_policy(RetryPolicy {
                retries: 2,
                backoff: Duration::from_millis(1),
            });
        (service, store)
    }

    #[tokio::test]
    async fn lost_race_to_same_identity_reports_already_voted() {
        let (service, store) = racing_service(Some("A"));
        let poll = service
            .create_poll("Q?", &strings(&["a", "b"]), None)
            .await
            .unwrap();

        let err = service
            .submit_vote_with_retry(poll.id, poll.options[0].id, "A")
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::AlreadyVoted));
        assert_eq!(store.applies.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn persistent_conflict_is_retried_then_surfaced() {
        let (service, store) = racing_service(None);
        let poll = service
            .create_poll("Q?", &strings(&["a", "b"]), None)
            .await
            .unwrap();

        let err = service
            .submit_vote_with_retry(poll.id, poll.options[0].id, "A")
            .await
            .unwrap_err();
        assert!(matches!(err, PollError::StorageConflict));
        assert_eq!(store.applies.load(Ordering::SeqCst), 3);
        assert_eq!(service.get_results(poll.id).await.unwrap().total_votes, 0);
    }
}
