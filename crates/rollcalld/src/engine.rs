use crate::config::Config;
use crate::extractor::CommandExtractor;
use chrono::{Local, NaiveDate, NaiveDateTime};
use rollcall_core::{DistanceMetric, Embedding, Matcher};
use rollcall_store::coordinator::{self, CoordinatorError, Recognition};
use rollcall_store::{GalleryStore, Ledger, LedgerBook, StoreError};
use serde::Serialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("no embedding extractor configured (set extractor_command)")]
    NoExtractor,
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Result of an enrollment.
#[derive(Debug, Clone, Serialize)]
pub struct EnrollReceipt {
    pub identity: String,
    pub dimension: usize,
    /// Gallery size after the enrollment.
    pub records: usize,
}

/// One enrolled identity.
#[derive(Debug, Clone, Serialize)]
pub struct IdentitySummary {
    pub identity: String,
    pub records: usize,
}

/// Snapshot of engine state for `Status`.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub version: &'static str,
    pub gallery_path: PathBuf,
    pub records: usize,
    pub identities: usize,
    pub dimension: Option<usize>,
    pub metric: DistanceMetric,
    pub threshold: f64,
    pub today: NaiveDate,
    pub present_today: usize,
    /// Days with a ledger on disk, oldest first.
    pub ledger_days: Vec<NaiveDate>,
    pub extractor: Option<String>,
}

/// Messages sent from D-Bus handlers to the engine thread.
enum EngineRequest {
    Enroll {
        identity: String,
        vector: Vec<f64>,
        authorized: bool,
        reply: oneshot::Sender<Result<EnrollReceipt, EngineError>>,
    },
    EnrollImage {
        identity: String,
        image: PathBuf,
        authorized: bool,
        reply: oneshot::Sender<Result<EnrollReceipt, EngineError>>,
    },
    Recognize {
        vector: Vec<f64>,
        reply: oneshot::Sender<Result<Recognition, EngineError>>,
    },
    RecognizeImage {
        image: PathBuf,
        reply: oneshot::Sender<Result<Recognition, EngineError>>,
    },
    ListIdentities {
        reply: oneshot::Sender<Vec<IdentitySummary>>,
    },
    ClearGallery {
        authorized: bool,
        reply: oneshot::Sender<Result<usize, EngineError>>,
    },
    ClearToday {
        authorized: bool,
        reply: oneshot::Sender<Result<bool, EngineError>>,
    },
    Export {
        day: Option<NaiveDate>,
        reply: oneshot::Sender<Result<Vec<u8>, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<Result<EngineStatus, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> EngineRequest,
    ) -> Result<T, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(make(reply_tx))
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }

    /// Enroll a pre-extracted embedding.
    pub async fn enroll(
        &self,
        identity: String,
        vector: Vec<f64>,
        authorized: bool,
    ) -> Result<EnrollReceipt, EngineError> {
        self.request(|reply| EngineRequest::Enroll {
            identity,
            vector,
            authorized,
            reply,
        })
        .await?
    }

    /// Run the extractor on `image` and enroll the result.
    pub async fn enroll_image(
        &self,
        identity: String,
        image: PathBuf,
        authorized: bool,
    ) -> Result<EnrollReceipt, EngineError> {
        self.request(|reply| EngineRequest::EnrollImage {
            identity,
            image,
            authorized,
            reply,
        })
        .await?
    }

    /// Match a probe embedding and record today's attendance on a hit.
    pub async fn recognize(&self, vector: Vec<f64>) -> Result<Recognition, EngineError> {
        self.request(|reply| EngineRequest::Recognize { vector, reply })
            .await?
    }

    /// Run the extractor on `image`, then recognize.
    pub async fn recognize_image(&self, image: PathBuf) -> Result<Recognition, EngineError> {
        self.request(|reply| EngineRequest::RecognizeImage { image, reply })
            .await?
    }

    pub async fn list_identities(&self) -> Result<Vec<IdentitySummary>, EngineError> {
        self.request(|reply| EngineRequest::ListIdentities { reply })
            .await
    }

    /// Delete every enrolled embedding. Returns the number removed.
    pub async fn clear_gallery(&self, authorized: bool) -> Result<usize, EngineError> {
        self.request(|reply| EngineRequest::ClearGallery { authorized, reply })
            .await?
    }

    /// Delete today's ledger. Returns whether one existed.
    pub async fn clear_today(&self, authorized: bool) -> Result<bool, EngineError> {
        self.request(|reply| EngineRequest::ClearToday { authorized, reply })
            .await?
    }

    /// CSV export of the ledger for `day` (today when `None`).
    pub async fn export(&self, day: Option<NaiveDate>) -> Result<Vec<u8>, EngineError> {
        self.request(|reply| EngineRequest::Export { day, reply })
            .await?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        self.request(|reply| EngineRequest::Status { reply })
            .await?
    }
}

type Clock = Box<dyn Fn() -> NaiveDateTime + Send>;

/// State owned by the engine thread. Being the only writer in this
/// process, it serializes every gallery and ledger mutation.
struct EngineState {
    gallery: GalleryStore,
    book: LedgerBook,
    /// Cached ledger for the most recently touched day.
    today: Option<Ledger>,
    matcher: Box<dyn Matcher + Send>,
    metric: DistanceMetric,
    threshold: f64,
    extractor: Option<CommandExtractor>,
    clock: Clock,
}

/// Spawn the engine on a dedicated OS thread.
///
/// Loads the gallery synchronously first so that a corrupt store stops
/// the daemon at startup with the file left untouched.
pub fn spawn_engine(config: &Config) -> Result<EngineHandle, EngineError> {
    spawn_with_clock(config, Box::new(|| Local::now().naive_local()))
}

fn spawn_with_clock(config: &Config, clock: Clock) -> Result<EngineHandle, EngineError> {
    let gallery = GalleryStore::load(&config.gallery_path, config.default_dimension)?;
    let book = LedgerBook::new(&config.ledger_dir);

    let extractor = config
        .extractor_command
        .as_deref()
        .and_then(CommandExtractor::from_command);
    match &extractor {
        Some(e) => tracing::info!(program = e.program(), "embedding extractor configured"),
        None => tracing::info!("no embedding extractor; image requests will be refused"),
    }

    let mut state = EngineState {
        gallery,
        book,
        today: None,
        matcher: config.metric.matcher(),
        metric: config.metric,
        threshold: config.match_threshold,
        extractor,
        clock,
    };

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                state.handle(req);
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

impl EngineState {
    fn handle(&mut self, req: EngineRequest) {
        match req {
            EngineRequest::Enroll {
                identity,
                vector,
                authorized,
                reply,
            } => {
                let _ = reply.send(self.enroll(&identity, Embedding::new(vector), authorized));
            }
            EngineRequest::EnrollImage {
                identity,
                image,
                authorized,
                reply,
            } => {
                let _ = reply.send(self.enroll_image(&identity, &image, authorized));
            }
            EngineRequest::Recognize { vector, reply } => {
                let _ = reply.send(self.recognize(Embedding::new(vector)));
            }
            EngineRequest::RecognizeImage { image, reply } => {
                let _ = reply.send(self.recognize_image(&image));
            }
            EngineRequest::ListIdentities { reply } => {
                let _ = reply.send(self.identities());
            }
            EngineRequest::ClearGallery { authorized, reply } => {
                let result = coordinator::clear_gallery(&authorized, &mut self.gallery);
                let _ = reply.send(result.map_err(EngineError::from));
            }
            EngineRequest::ClearToday { authorized, reply } => {
                let _ = reply.send(self.clear_today(authorized));
            }
            EngineRequest::Export { day, reply } => {
                let _ = reply.send(self.export(day));
            }
            EngineRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn enroll(&mut self, identity: &str, embedding: Embedding, authorized: bool) -> Result<EnrollReceipt, EngineError> {
        coordinator::enroll(&authorized, &mut self.gallery, identity, embedding)?;
        Ok(self.receipt())
    }

    fn enroll_image(&mut self, identity: &str, image: &Path, authorized: bool) -> Result<EnrollReceipt, EngineError> {
        let extractor = self.extractor.as_mut().ok_or(EngineError::NoExtractor)?;
        coordinator::enroll_image(&authorized, extractor, &mut self.gallery, identity, image)?;
        Ok(self.receipt())
    }

    fn receipt(&self) -> EnrollReceipt {
        let gallery = self.gallery.gallery();
        let (identity, dimension) = gallery
            .records()
            .last()
            .map(|r| (r.identity.clone(), r.embedding.dimension()))
            .unwrap_or_default();
        EnrollReceipt {
            identity,
            dimension,
            records: gallery.len(),
        }
    }

    fn recognize(&mut self, probe: Embedding) -> Result<Recognition, EngineError> {
        let now = (self.clock)();
        let ledger = cached_ledger(&mut self.today, &self.book, now.date())?;
        Ok(coordinator::recognize(
            self.gallery.gallery(),
            ledger,
            self.matcher.as_ref(),
            self.threshold,
            &probe,
            now,
        )?)
    }

    fn recognize_image(&mut self, image: &Path) -> Result<Recognition, EngineError> {
        let now = (self.clock)();
        let extractor = self.extractor.as_mut().ok_or(EngineError::NoExtractor)?;
        let ledger = cached_ledger(&mut self.today, &self.book, now.date())?;
        Ok(coordinator::recognize_image(
            extractor,
            self.gallery.gallery(),
            ledger,
            self.matcher.as_ref(),
            self.threshold,
            image,
            now,
        )?)
    }

    fn identities(&self) -> Vec<IdentitySummary> {
        self.gallery
            .gallery()
            .identities()
            .into_iter()
            .map(|(identity, records)| IdentitySummary { identity, records })
            .collect()
    }

    fn clear_today(&mut self, authorized: bool) -> Result<bool, EngineError> {
        let day = (self.clock)().date();
        let existed = coordinator::clear_day(&authorized, &self.book, day)?;
        if self.today.as_ref().is_some_and(|l| l.day() == day) {
            self.today = None;
        }
        Ok(existed)
    }

    fn export(&mut self, day: Option<NaiveDate>) -> Result<Vec<u8>, EngineError> {
        let today = (self.clock)().date();
        let day = day.unwrap_or(today);
        if day == today {
            return Ok(cached_ledger(&mut self.today, &self.book, day)?.export()?);
        }
        Ok(self.book.load(day)?.export()?)
    }

    fn status(&mut self) -> Result<EngineStatus, EngineError> {
        let today = (self.clock)().date();
        let present_today = cached_ledger(&mut self.today, &self.book, today)?.len();
        let gallery = self.gallery.gallery();
        Ok(EngineStatus {
            version: env!("CARGO_PKG_VERSION"),
            gallery_path: self.gallery.path().to_path_buf(),
            records: gallery.len(),
            identities: gallery.identities().len(),
            dimension: gallery.dimension(),
            metric: self.metric,
            threshold: self.threshold,
            today,
            present_today,
            ledger_days: self.book.days()?,
            extractor: self.extractor.as_ref().map(|e| e.program().to_string()),
        })
    }
}

/// Ledger for `day` out of the single-day cache, reloading from disk
/// when the calendar day has rolled over.
fn cached_ledger<'a>(
    slot: &'a mut Option<Ledger>,
    book: &LedgerBook,
    day: NaiveDate,
) -> Result<&'a mut Ledger, StoreError> {
    let ledger = match slot.take() {
        Some(ledger) if ledger.day() == day => ledger,
        previous => {
            let ledger = book.load(day)?;
            if previous.is_some() {
                tracing::info!(%day, records = ledger.len(), "attendance day rolled over");
            }
            ledger
        }
    };
    Ok(slot.insert(ledger))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollcall_core::{CoreError, MatchResult};
    use rollcall_store::RecordOutcome;
    use std::sync::{Arc, Mutex};

    fn test_config(dir: &tempfile::TempDir) -> Config {
        Config {
            gallery_path: dir.path().join("faces.csv"),
            ledger_dir: dir.path().join("attendance"),
            match_threshold: 0.68,
            metric: DistanceMetric::Euclidean,
            default_dimension: None,
            extractor_command: None,
            session_bus: true,
            operator_uids: vec![0],
        }
    }

    fn at(day: u32, hour: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 3, day)
            .unwrap()
            .and_hms_opt(hour, 0, 0)
            .unwrap()
    }

    fn spawn_at(config: &Config, now: Arc<Mutex<NaiveDateTime>>) -> EngineHandle {
        spawn_with_clock(config, Box::new(move || *now.lock().unwrap())).unwrap()
    }

    #[tokio::test]
    async fn enroll_requires_operator() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = spawn_engine(&test_config(&dir)).unwrap();

        let err = engine.enroll("ada".into(), vec![0.1, 0.2], false).await.unwrap_err();
        assert!(matches!(err, EngineError::Coordinator(CoordinatorError::Unauthorized)));
        assert!(engine.list_identities().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn enroll_recognize_and_dedup() {
        let dir = tempfile::TempDir::new().unwrap();
        let now = Arc::new(Mutex::new(at(18, 9)));
        let engine = spawn_at(&test_config(&dir), now.clone());

        let receipt = engine.enroll("ada".into(), vec![0.1, 0.2, 0.3], true).await.unwrap();
        assert_eq!(receipt.identity, "ada");
        assert_eq!(receipt.dimension, 3);
        assert_eq!(receipt.records, 1);
        engine.enroll("bob".into(), vec![0.9, 0.8, 0.7], true).await.unwrap();

        let first = engine.recognize(vec![0.1, 0.2, 0.3]).await.unwrap();
        assert_eq!(first.result.identity(), Some("ada"));
        assert_eq!(first.attendance, Some(RecordOutcome::Recorded { timestamp: at(18, 9) }));

        *now.lock().unwrap() = at(18, 15);
        let second = engine.recognize(vec![0.1, 0.2, 0.3]).await.unwrap();
        assert_eq!(second.attendance, Some(RecordOutcome::AlreadyRecorded { first_seen: at(18, 9) }));

        let status = engine.status().await.unwrap();
        assert_eq!(status.records, 2);
        assert_eq!(status.identities, 2);
        assert_eq!(status.dimension, Some(3));
        assert_eq!(status.present_today, 1);
        assert_eq!(status.ledger_days, vec![at(18, 0).date()]);
    }

    #[tokio::test]
    async fn unknown_face_is_not_recorded() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = spawn_at(&test_config(&dir), Arc::new(Mutex::new(at(18, 9))));
        engine.enroll("ada".into(), vec![0.0, 0.0], true).await.unwrap();

        let outcome = engine.recognize(vec![3.0, 4.0]).await.unwrap();
        assert_eq!(outcome.result, MatchResult::NoMatch { best_distance: Some(5.0) });
        assert!(outcome.attendance.is_none());
        assert_eq!(engine.status().await.unwrap().present_today, 0);
    }

    #[tokio::test]
    async fn wrong_dimension_probe_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = spawn_engine(&test_config(&dir)).unwrap();
        engine.enroll("ada".into(), vec![0.0, 0.0], true).await.unwrap();

        let err = engine.recognize(vec![1.0]).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::Coordinator(CoordinatorError::Invalid(CoreError::DimensionMismatch { .. }))
        ));
    }

    #[tokio::test]
    async fn day_rollover_starts_a_new_ledger() {
        let dir = tempfile::TempDir::new().unwrap();
        let now = Arc::new(Mutex::new(at(18, 17)));
        let engine = spawn_at(&test_config(&dir), now.clone());
        engine.enroll("ada".into(), vec![1.0], true).await.unwrap();

        engine.recognize(vec![1.0]).await.unwrap();
        *now.lock().unwrap() = at(19, 8);
        let next_day = engine.recognize(vec![1.0]).await.unwrap();
        assert_eq!(next_day.attendance, Some(RecordOutcome::Recorded { timestamp: at(19, 8) }));

        let monday = engine.export(Some(at(18, 0).date())).await.unwrap();
        let text = String::from_utf8(monday).unwrap();
        assert_eq!(text, "identity,timestamp,present\nada,2024-03-18 17:00:00,true\n");
    }

    #[tokio::test]
    async fn clear_today_and_export() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = spawn_at(&test_config(&dir), Arc::new(Mutex::new(at(18, 9))));
        engine.enroll("ada".into(), vec![1.0], true).await.unwrap();
        engine.recognize(vec![1.0]).await.unwrap();

        assert!(matches!(
            engine.clear_today(false).await,
            Err(EngineError::Coordinator(CoordinatorError::Unauthorized))
        ));
        assert!(engine.clear_today(true).await.unwrap());

        let exported = engine.export(None).await.unwrap();
        assert_eq!(exported, b"identity,timestamp,present\n");

        // Recognized again after the ledger was discarded.
        let again = engine.recognize(vec![1.0]).await.unwrap();
        assert!(matches!(again.attendance, Some(RecordOutcome::Recorded { .. })));
    }

    #[tokio::test]
    async fn clear_gallery_resets_dimension() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = spawn_engine(&test_config(&dir)).unwrap();
        engine.enroll("ada".into(), vec![1.0, 2.0], true).await.unwrap();
        engine.enroll("ada".into(), vec![1.1, 2.1], true).await.unwrap();

        assert_eq!(engine.clear_gallery(true).await.unwrap(), 2);
        let receipt = engine.enroll("ada".into(), vec![1.0, 2.0, 3.0], true).await.unwrap();
        assert_eq!(receipt.dimension, 3);
    }

    #[tokio::test]
    async fn image_requests_need_an_extractor() {
        let dir = tempfile::TempDir::new().unwrap();
        let engine = spawn_engine(&test_config(&dir)).unwrap();
        let err = engine
            .recognize_image(dir.path().join("face.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NoExtractor));
    }

    #[tokio::test]
    async fn image_enroll_through_extractor() {
        let dir = tempfile::TempDir::new().unwrap();
        let image = dir.path().join("face.jpg");
        std::fs::write(&image, b"jpeg").unwrap();
        let mut config = test_config(&dir);
        config.extractor_command = Some(vec![
            "/bin/sh".into(),
            "-c".into(),
            "echo '[0.5, 0.5]'".into(),
            "extractor".into(),
        ]);
        let engine = spawn_at(&config, Arc::new(Mutex::new(at(18, 9))));

        let receipt = engine.enroll_image("ada".into(), image.clone(), true).await.unwrap();
        assert_eq!(receipt.dimension, 2);
        let outcome = engine.recognize_image(image).await.unwrap();
        assert_eq!(outcome.result.identity(), Some("ada"));
    }

    #[test]
    fn corrupt_gallery_fails_startup_and_is_left_alone() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(&dir);
        let content = "identity,e0,e1\nada,1.0\n";
        std::fs::write(&config.gallery_path, content).unwrap();

        let err = spawn_engine(&config).err().unwrap();
        assert!(matches!(err, EngineError::Store(StoreError::CorruptStore { .. })));
        assert_eq!(std::fs::read_to_string(&config.gallery_path).unwrap(), content);
    }
}
