//! Recurring daily Discord scheduled event ("Wordle") per guild.
//!
//! Each running guild owns a timer task that sleeps until the current window
//! ends, then computes the next daily window, creates the external event and
//! persists the new state. The loop re-arms itself after every window.

use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use cron::Schedule;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep, sleep_until};
use tracing::{debug, error, info, warn};

use crate::relay::store::{DurableStore, Fields};

pub const WORDLE_SCHEMA_VERSION: u32 = 1;

pub fn wordle_key(guild_id: u64) -> String {
    format!("{}:wordle", guild_id)
}

#[derive(Debug, thiserror::Error)]
pub enum GuildError {
    #[error("guild API error: {0}")]
    Api(String),
    #[error("invalid schedule: {0}")]
    Schedule(#[from] cron::error::Error),
    #[error("schedule has no upcoming occurrence")]
    NoOccurrence,
}

/// Scheduled-event operations on the guild platform.
#[async_trait]
pub trait GuildEvents: Send + Sync {
    /// Create an external event spanning `[start, end)`.
    async fn create_event(
        &self,
        guild_id: u64,
        name: &str,
        location: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<(), GuildError>;

    /// Delete every scheduled event of the guild. Returns how many were deleted.
    async fn clear_events(&self, guild_id: u64) -> Result<usize, GuildError>;
}

/// Static parameters of the daily event.
#[derive(Debug, Clone, PartialEq)]
pub struct WordleSettings {
    pub event_name: String,
    pub event_selector: String,
    pub location: String,
    pub start_hour: u32,
    pub start_min: u32,
    pub duration: Duration,
}

impl Default for WordleSettings {
    fn default() -> Self {
        Self {
            event_name: "Угадывай слово".to_string(),
            event_selector: "#wordle".to_string(),
            location: "https://www.nytimes.com/games/wordle/index.html".to_string(),
            start_hour: 21,
            start_min: 0,
            duration: Duration::from_secs((23 * 60 + 45) * 60),
        }
    }
}

/// Next daily window strictly after `now`, in UTC.
pub fn next_window(
    now: DateTime<Utc>,
    start_hour: u32,
    start_min: u32,
    duration: Duration,
) -> Result<(DateTime<Utc>, DateTime<Utc>), GuildError> {
    // cron crate uses 7-field format: sec min hour day month dow year
    let expr = format!("0 {} {} * * * *", start_min, start_hour);
    let schedule = Schedule::from_str(&expr)?;
    let start = schedule.after(&now).next().ok_or(GuildError::NoOccurrence)?;
    let span = chrono::Duration::from_std(duration).map_err(|_| GuildError::NoOccurrence)?;
    Ok((start, start + span))
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleRecordError {
    #[error("unsupported wordle schema version {0}")]
    Version(u32),
    #[error("malformed timestamp in field {0}")]
    Timestamp(&'static str),
}

/// Per-guild schedule state, mirrored to `"{guild_id}:wordle"`.
#[derive(Debug, Clone, PartialEq)]
pub struct WordleSchedule {
    pub guild_id: u64,
    pub event_name: String,
    pub event_selector: String,
    pub next_start: Option<DateTime<Utc>>,
    pub next_end: Option<DateTime<Utc>>,
    pub running: bool,
}

impl WordleSchedule {
    pub fn new(guild_id: u64, settings: &WordleSettings) -> Self {
        Self {
            guild_id,
            event_name: settings.event_name.clone(),
            event_selector: settings.event_selector.clone(),
            next_start: None,
            next_end: None,
            running: false,
        }
    }

    pub fn key(&self) -> String {
        wordle_key(self.guild_id)
    }

    pub fn to_fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("schema_version".into(), WORDLE_SCHEMA_VERSION.to_string());
        fields.insert("event_name".into(), self.event_name.clone());
        fields.insert("event_selector".into(), self.event_selector.clone());
        if let Some(start) = self.next_start {
            fields.insert("next_start".into(), start.timestamp_millis().to_string());
        }
        if let Some(end) = self.next_end {
            fields.insert("next_end".into(), end.timestamp_millis().to_string());
        }
        fields.insert("running".into(), self.running.to_string());
        fields
    }

    /// Parse a stored record. `Ok(None)` when there is nothing to restore.
    /// Records written before versioning carry no `schema_version`.
    pub fn from_fields(guild_id: u64, fields: &Fields) -> Result<Option<Self>, ScheduleRecordError> {
        let version = fields
            .get("schema_version")
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(0);
        if version > WORDLE_SCHEMA_VERSION {
            return Err(ScheduleRecordError::Version(version));
        }
        let Some(event_name) = fields.get("event_name").filter(|n| !n.is_empty()) else {
            return Ok(None);
        };

        let millis = |field: &'static str| -> Result<Option<DateTime<Utc>>, ScheduleRecordError> {
            match fields.get(field).map(|v| v.trim()).filter(|v| !v.is_empty()) {
                None => Ok(None),
                Some(raw) => raw
                    .parse::<f64>()
                    .ok()
                    .and_then(|ms| DateTime::from_timestamp_millis(ms as i64))
                    .map(Some)
                    .ok_or(ScheduleRecordError::Timestamp(field)),
            }
        };

        Ok(Some(Self {
            guild_id,
            event_name: event_name.clone(),
            event_selector: fields.get("event_selector").cloned().unwrap_or_default(),
            next_start: millis("next_start")?,
            next_end: millis("next_end")?,
            running: fields.get("running").is_some_and(|r| r == "true"),
        }))
    }
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

/// Outcome of a start request.
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(WordleSchedule),
    AlreadyRunning(WordleSchedule),
}

struct Shared {
    store: Arc<DurableStore>,
    events: Arc<dyn GuildEvents>,
    settings: WordleSettings,
    clock: Clock,
}

struct GuildEntry {
    schedule: Arc<Mutex<WordleSchedule>>,
    timer: Option<JoinHandle<()>>,
}

impl GuildEntry {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Owns every guild's schedule and its timer task.
pub struct WordleScheduler {
    shared: Arc<Shared>,
    guilds: tokio::sync::Mutex<HashMap<u64, GuildEntry>>,
}

impl WordleScheduler {
    pub fn new(store: Arc<DurableStore>, events: Arc<dyn GuildEvents>, settings: WordleSettings) -> Self {
        Self::with_clock(store, events, settings, Arc::new(Utc::now))
    }

    pub fn with_clock(
        store: Arc<DurableStore>,
        events: Arc<dyn GuildEvents>,
        settings: WordleSettings,
        clock: Clock,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                events,
                settings,
                clock,
            }),
            guilds: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        (self.shared.clock)()
    }

    /// Whole minutes until the schedule's next start, never negative.
    pub fn minutes_until_start(&self, schedule: &WordleSchedule) -> i64 {
        schedule
            .next_start
            .map(|start| (start - self.now()).num_minutes().max(0))
            .unwrap_or(0)
    }

    /// Create the next event and arm the recurring timer.
    pub async fn start(&self, guild_id: u64) -> Result<StartOutcome, GuildError> {
        let mut guilds = self.guilds.lock().await;
        let entry = guilds.entry(guild_id).or_insert_with(|| GuildEntry {
            schedule: Arc::new(Mutex::new(WordleSchedule::new(guild_id, &self.shared.settings))),
            timer: None,
        });

        if let Some(schedule) = snapshot(&entry.schedule).filter(|s| s.running) {
            return Ok(StartOutcome::AlreadyRunning(schedule));
        }

        let next_end = self.shared.open_window(&entry.schedule).await?;
        entry.cancel_timer();
        entry.timer = Some(spawn_timer(
            self.shared.clone(),
            entry.schedule.clone(),
            Some(self.shared.instant_at(next_end)),
        ));

        let schedule = snapshot(&entry.schedule).ok_or_else(|| GuildError::Api("schedule lock poisoned".into()))?;
        info!("📅 Wordle scheduler started for guild {}", guild_id);
        Ok(StartOutcome::Started(schedule))
    }

    /// Cancel the timer and mark the schedule stopped. Returns false if it
    /// was not running.
    pub async fn stop(&self, guild_id: u64) -> bool {
        let mut guilds = self.guilds.lock().await;
        let Some(entry) = guilds.get_mut(&guild_id) else {
            return false;
        };
        entry.cancel_timer();

        let was_running = snapshot(&entry.schedule).is_some_and(|s| s.running);
        self.shared.update(&entry.schedule, |s| s.running = false);
        if was_running {
            info!("📅 Wordle scheduler stopped for guild {}", guild_id);
        }
        was_running
    }

    pub async fn status(&self, guild_id: u64) -> Option<WordleSchedule> {
        let guilds = self.guilds.lock().await;
        guilds.get(&guild_id).and_then(|e| snapshot(&e.schedule))
    }

    /// Load the guild's persisted schedule and resume it. A live schedule is
    /// left alone.
    pub async fn restore(&self, guild_id: u64) -> Option<WordleSchedule> {
        if self.guilds.lock().await.contains_key(&guild_id) {
            debug!("Wordle scheduler for guild {} already live", guild_id);
            return None;
        }
        if !self.shared.store.is_enabled() {
            return None;
        }

        let key = wordle_key(guild_id);
        let fields = self.shared.store.load(&key).await?;
        let schedule = match WordleSchedule::from_fields(guild_id, &fields) {
            Ok(Some(schedule)) => schedule,
            Ok(None) => {
                info!("Nothing to restore for {}", key);
                return None;
            }
            Err(e) => {
                warn!("Skipping wordle record {}: {}", key, e);
                return None;
            }
        };
        info!(
            "♻️ Restored {}: running={} next_end={:?}",
            key, schedule.running, schedule.next_end
        );

        let mut guilds = self.guilds.lock().await;
        if guilds.contains_key(&guild_id) {
            return None;
        }
        let shared_schedule = Arc::new(Mutex::new(schedule.clone()));
        let timer = if schedule.running {
            let deadline = schedule
                .next_end
                .filter(|end| *end > self.now() && schedule.next_start.is_some())
                .map(|end| self.shared.instant_at(end));
            if deadline.is_none() {
                info!("Window for guild {} already passed, opening a new one", guild_id);
            }
            Some(spawn_timer(self.shared.clone(), shared_schedule.clone(), deadline))
        } else {
            None
        };
        guilds.insert(
            guild_id,
            GuildEntry {
                schedule: shared_schedule,
                timer,
            },
        );
        Some(schedule)
    }

    /// Delete every scheduled event in the guild.
    pub async fn clear_all(&self, guild_id: u64) -> Result<usize, GuildError> {
        let deleted = self.shared.events.clear_events(guild_id).await?;
        info!("🧹 Deleted {} scheduled event(s) in guild {}", deleted, guild_id);
        Ok(deleted)
    }

    /// Delete every event, stop the scheduler and forget its record.
    pub async fn whitelist(&self, guild_id: u64) -> Result<usize, GuildError> {
        let deleted = self.clear_all(guild_id).await?;
        let mut guilds = self.guilds.lock().await;
        if let Some(mut entry) = guilds.remove(&guild_id) {
            entry.cancel_timer();
        }
        self.shared.store.erase(&wordle_key(guild_id));
        info!("Wordle state wiped for guild {}", guild_id);
        Ok(deleted)
    }
}

impl Drop for WordleScheduler {
    fn drop(&mut self) {
        for entry in self.guilds.get_mut().values_mut() {
            entry.cancel_timer();
        }
    }
}

fn snapshot(schedule: &Mutex<WordleSchedule>) -> Option<WordleSchedule> {
    schedule.lock().ok().map(|s| s.clone())
}

fn spawn_timer(
    shared: Arc<Shared>,
    schedule: Arc<Mutex<WordleSchedule>>,
    first_deadline: Option<Instant>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut deadline = first_deadline;
        loop {
            if let Some(deadline) = deadline {
                sleep_until(deadline).await;
            }
            match shared.open_window_with_retry(&schedule).await {
                Some(end) => deadline = Some(shared.instant_at(end)),
                None => {
                    shared.update(&schedule, |s| s.running = false);
                    return;
                }
            }
        }
    })
}

impl Shared {
    fn instant_at(&self, at: DateTime<Utc>) -> Instant {
        let remaining = (at - (self.clock)()).to_std().unwrap_or(Duration::ZERO);
        Instant::now() + remaining
    }

    /// Apply a mutation and persist the result.
    fn update(&self, schedule: &Mutex<WordleSchedule>, f: impl FnOnce(&mut WordleSchedule)) {
        let Ok(mut guard) = schedule.lock() else {
            error!("Wordle schedule lock poisoned");
            return;
        };
        f(&mut guard);
        self.store.persist(&guard.key(), guard.to_fields());
    }

    /// Compute the next window, create its event and persist. Returns the
    /// window end.
    async fn open_window(&self, schedule: &Mutex<WordleSchedule>) -> Result<DateTime<Utc>, GuildError> {
        let (guild_id, name) = {
            let guard = schedule
                .lock()
                .map_err(|_| GuildError::Api("schedule lock poisoned".into()))?;
            (guard.guild_id, guard.event_name.clone())
        };
        let settings = &self.settings;
        let (start, end) = next_window((self.clock)(), settings.start_hour, settings.start_min, settings.duration)?;

        self.events
            .create_event(guild_id, &name, &settings.location, start, end)
            .await?;
        info!("📅 Created '{}' in guild {} for {} → {}", name, guild_id, start, end);

        self.update(schedule, |s| {
            s.next_start = Some(start);
            s.next_end = Some(end);
            s.running = true;
        });
        Ok(end)
    }

    async fn open_window_with_retry(&self, schedule: &Mutex<WordleSchedule>) -> Option<DateTime<Utc>> {
        let policy = self.store.policy();
        let mut retries = 0;
        loop {
            match self.open_window(schedule).await {
                Ok(end) => return Some(end),
                Err(e) if retries < policy.max_retries => {
                    retries += 1;
                    warn!(
                        "Failed to create scheduled event: {} (retry {}/{})",
                        e, retries, policy.max_retries
                    );
                    sleep(policy.interval).await;
                }
                Err(e) => {
                    error!("Giving up on scheduled event creation: {}", e);
                    return None;
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fake::{RecordingGuildEvents, clock_from};
    use super::*;
    use crate::relay::store::{KvStore, MemoryStore, RetryPolicy};
    use chrono::TimeZone;

    const GUILD: u64 = 7;

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 10, h, m, s).unwrap()
    }

    fn scheduler(
        backend: &Arc<MemoryStore>,
        events: &Arc<RecordingGuildEvents>,
        now: DateTime<Utc>,
    ) -> WordleScheduler {
        let store = Arc::new(DurableStore::new(backend.clone(), RetryPolicy::default()));
        WordleScheduler::with_clock(store, events.clone(), WordleSettings::default(), clock_from(now))
    }

    async fn settle() {
        sleep(Duration::from_millis(1)).await;
    }

    #[test]
    fn test_next_window_today_before_start() {
        let (start, end) = next_window(at(20, 59, 59), 21, 0, Duration::from_secs(3600)).unwrap();
        assert_eq!(start, at(21, 0, 0));
        assert_eq!(end, at(22, 0, 0));
    }

    #[test]
    fn test_next_window_rolls_to_tomorrow() {
        let (start, _) = next_window(at(21, 0, 0), 21, 0, Duration::from_secs(60)).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 5, 11, 21, 0, 0).unwrap());

        let (start, _) = next_window(at(23, 10, 0), 21, 30, Duration::from_secs(60)).unwrap();
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 5, 11, 21, 30, 0).unwrap());
    }

    #[test]
    fn test_next_end_is_start_plus_duration() {
        let duration = WordleSettings::default().duration;
        let (start, end) = next_window(at(8, 0, 0), 21, 0, duration).unwrap();
        assert_eq!(end - start, chrono::Duration::minutes(23 * 60 + 45));
    }

    #[test]
    fn test_schedule_fields_round_trip() {
        let mut schedule = WordleSchedule::new(GUILD, &WordleSettings::default());
        schedule.next_start = Some(at(21, 0, 0));
        schedule.next_end = Some(at(22, 0, 0));
        schedule.running = true;

        let fields = schedule.to_fields();
        assert_eq!(fields.get("running").map(String::as_str), Some("true"));
        assert_eq!(
            fields.get("next_start").cloned(),
            Some(at(21, 0, 0).timestamp_millis().to_string())
        );
        let parsed = WordleSchedule::from_fields(GUILD, &fields).unwrap().unwrap();
        assert_eq!(parsed, schedule);
    }

    #[test]
    fn test_unversioned_record_is_accepted() {
        let mut fields = Fields::new();
        fields.insert("event_name".into(), "Wordle".into());
        fields.insert("event_selector".into(), "#wordle".into());
        fields.insert("next_start".into(), "1715374800000".into());
        fields.insert("running".into(), "false".into());

        let parsed = WordleSchedule::from_fields(GUILD, &fields).unwrap().unwrap();
        assert_eq!(parsed.event_name, "Wordle");
        assert!(parsed.next_start.is_some());
        assert!(parsed.next_end.is_none());
        assert!(!parsed.running);
    }

    #[test]
    fn test_empty_record_restores_nothing() {
        assert!(WordleSchedule::from_fields(GUILD, &Fields::new()).unwrap().is_none());

        let mut fields = Fields::new();
        fields.insert("schema_version".into(), "9".into());
        fields.insert("event_name".into(), "Wordle".into());
        assert!(WordleSchedule::from_fields(GUILD, &fields).is_err());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_start_creates_event_and_persists() {
        let backend = Arc::new(MemoryStore::new());
        let events = Arc::new(RecordingGuildEvents::default());
        let scheduler = scheduler(&backend, &events, at(12, 0, 0));

        let outcome = scheduler.start(GUILD).await.unwrap();
        let StartOutcome::Started(schedule) = outcome else {
            panic!("expected Started");
        };
        assert!(schedule.running);
        assert_eq!(schedule.next_start, Some(at(21, 0, 0)));
        assert_eq!(scheduler.minutes_until_start(&schedule), 9 * 60);

        let created = events.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].location, WordleSettings::default().location);

        settle().await;
        let stored = backend.hgetall(&wordle_key(GUILD)).await.unwrap();
        assert_eq!(stored.get("running").map(String::as_str), Some("true"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_start_twice_reports_running() {
        let backend = Arc::new(MemoryStore::new());
        let events = Arc::new(RecordingGuildEvents::default());
        let scheduler = scheduler(&backend, &events, at(12, 0, 0));

        scheduler.start(GUILD).await.unwrap();
        let second = scheduler.start(GUILD).await.unwrap();
        assert!(matches!(second, StartOutcome::AlreadyRunning(_)));
        assert_eq!(events.created().len(), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_start_failure_leaves_stopped() {
        let backend = Arc::new(MemoryStore::new());
        let events = Arc::new(RecordingGuildEvents::default());
        events.set_failing(true);
        let scheduler = scheduler(&backend, &events, at(12, 0, 0));

        assert!(scheduler.start(GUILD).await.is_err());
        let status = scheduler.status(GUILD).await.unwrap();
        assert!(!status.running);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_timer_rearms_after_window() {
        let backend = Arc::new(MemoryStore::new());
        let events = Arc::new(RecordingGuildEvents::default());
        let scheduler = scheduler(&backend, &events, at(12, 0, 0));
        scheduler.start(GUILD).await.unwrap();

        // first window ends at 20:45 tomorrow
        sleep(Duration::from_secs((9 + 23) * 3600 + 45 * 60 + 1)).await;

        let created = events.created();
        assert_eq!(created.len(), 2);
        assert_eq!(created[1].start, Utc.with_ymd_and_hms(2024, 5, 11, 21, 0, 0).unwrap());
        let status = scheduler.status(GUILD).await.unwrap();
        assert_eq!(status.next_start, Some(created[1].start));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_stop_cancels_timer() {
        let backend = Arc::new(MemoryStore::new());
        let events = Arc::new(RecordingGuildEvents::default());
        let scheduler = scheduler(&backend, &events, at(12, 0, 0));
        scheduler.start(GUILD).await.unwrap();

        assert!(scheduler.stop(GUILD).await);
        assert!(!scheduler.stop(GUILD).await);
        sleep(Duration::from_secs(3 * 24 * 3600)).await;

        assert_eq!(events.created().len(), 1);
        let stored = backend.hgetall(&wordle_key(GUILD)).await.unwrap();
        assert_eq!(stored.get("running").map(String::as_str), Some("false"));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_restore_with_past_window_opens_new_one() {
        let backend = Arc::new(MemoryStore::new());
        let mut old = WordleSchedule::new(GUILD, &WordleSettings::default());
        old.next_start = Some(at(9, 0, 0) - chrono::Duration::days(2));
        old.next_end = Some(at(9, 0, 0) - chrono::Duration::days(1));
        old.running = true;
        backend.hset(&wordle_key(GUILD), &old.to_fields()).await.unwrap();

        let events = Arc::new(RecordingGuildEvents::default());
        let scheduler = scheduler(&backend, &events, at(12, 0, 0));
        let restored = scheduler.restore(GUILD).await.unwrap();
        assert!(restored.running);
        settle().await;

        let created = events.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].start, at(21, 0, 0));
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_restore_with_future_window_waits() {
        let backend = Arc::new(MemoryStore::new());
        let mut old = WordleSchedule::new(GUILD, &WordleSettings::default());
        old.next_start = Some(at(11, 0, 0));
        old.next_end = Some(at(13, 0, 0));
        old.running = true;
        backend.hset(&wordle_key(GUILD), &old.to_fields()).await.unwrap();

        let events = Arc::new(RecordingGuildEvents::default());
        let scheduler = scheduler(&backend, &events, at(12, 0, 0));
        scheduler.restore(GUILD).await.unwrap();

        sleep(Duration::from_secs(59 * 60)).await;
        assert!(events.created().is_empty());

        sleep(Duration::from_secs(2 * 60)).await;
        assert_eq!(events.created().len(), 1);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_restore_stopped_schedule_stays_idle() {
        let backend = Arc::new(MemoryStore::new());
        let old = WordleSchedule::new(GUILD, &WordleSettings::default());
        backend.hset(&wordle_key(GUILD), &old.to_fields()).await.unwrap();

        let events = Arc::new(RecordingGuildEvents::default());
        let scheduler = scheduler(&backend, &events, at(12, 0, 0));
        let restored = scheduler.restore(GUILD).await.unwrap();
        assert!(!restored.running);

        sleep(Duration::from_secs(2 * 24 * 3600)).await;
        assert!(events.created().is_empty());
        assert!(scheduler.restore(GUILD).await.is_none());
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_creation_retries_then_gives_up() {
        let backend = Arc::new(MemoryStore::new());
        let events = Arc::new(RecordingGuildEvents::default());
        let scheduler = scheduler(&backend, &events, at(12, 0, 0));
        scheduler.start(GUILD).await.unwrap();
        events.set_failing(true);

        sleep(Duration::from_secs(33 * 3600)).await;
        assert_eq!(events.attempts(), 1 + 16);
        let status = scheduler.status(GUILD).await.unwrap();
        assert!(!status.running);
    }

    #[tokio::test(flavor = "current_thread", start_paused = true)]
    async fn test_whitelist_wipes_everything() {
        let backend = Arc::new(MemoryStore::new());
        let events = Arc::new(RecordingGuildEvents::default());
        let scheduler = scheduler(&backend, &events, at(12, 0, 0));
        scheduler.start(GUILD).await.unwrap();
        settle().await;

        assert_eq!(scheduler.whitelist(GUILD).await.unwrap(), 1);
        settle().await;

        assert!(events.created().is_empty());
        assert!(scheduler.status(GUILD).await.is_none());
        assert!(backend.hgetall(&wordle_key(GUILD)).await.unwrap().is_empty());
    }
}
