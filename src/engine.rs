use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::{
    builder::CaptureOptions,
    config::{Config, EffectiveConfig},
    error::EngineError,
    intercept::{InterceptionTarget, UrlFilter},
    lock::LogLock,
    mode::{Mode, check_consistency, read_mode_flag, resolve_mode},
    player::{Player, PlayerOptions},
    recorder::Recorder,
    remap::{RemapFn, UrlRemapper},
    store::{LogStats, LogStore, LogValidation, TestIdentity},
};

/// Snapshot of an engine instance for reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineContext {
    pub mode: Mode,
    pub log_path: PathBuf,
    pub is_active: bool,
    pub effective_config: EffectiveConfig,
    /// Playback was requested but the log was unusable, so this run records.
    pub fell_back_to_record: bool,
}

#[derive(Debug)]
enum Session {
    Inactive,
    Disabled,
    Recording { recorder: Recorder, lock: LogLock },
    Playing { player: Player, lock: LogLock },
    /// Playback without a usable log, everything goes to the network.
    Live { lock: LogLock, reason: String },
}

/// One engine per test: decides the mode, owns the log lock, and wires the
/// recorder or player into the interception layer.
#[derive(Debug)]
pub struct TrafficReplay {
    config: Config,
    test: TestIdentity,
    requested_mode: Mode,
    mode: Mode,
    store: LogStore,
    log_path: PathBuf,
    record_filter: UrlFilter,
    playback_filter: UrlFilter,
    remapper: UrlRemapper,
    fell_back_to_record: bool,
    session: Session,
}

impl TrafficReplay {
    /// Reads the mode flag from the environment variable named by
    /// `config.mode_env`.
    pub fn new(config: Config, test: TestIdentity) -> Result<Self, EngineError> {
        let flag = read_mode_flag(&config.mode_env);
        Self::with_mode_flag(config, test, flag.as_deref())
    }

    /// Like [`TrafficReplay::new`] but with an explicit flag value instead of
    /// the environment.
    pub fn with_mode_flag(
        config: Config,
        test: TestIdentity,
        flag: Option<&str>,
    ) -> Result<Self, EngineError> {
        let mode = resolve_mode(config.force_mode, flag)?;
        for warning in check_consistency(&config, flag, mode) {
            tracing::warn!(test = %test.title, "{warning}");
        }

        let record_filter = UrlFilter::from_pattern(config.record.url_filter.as_deref())
            .map_err(|err| EngineError::InvalidConfig(format!("record.url_filter: {err}")))?;
        let playback_filter = UrlFilter::from_pattern(config.playback.url_filter.as_deref())
            .map_err(|err| EngineError::InvalidConfig(format!("playback.url_filter: {err}")))?;
        let remapper = UrlRemapper::from_config(&config.playback.remap)
            .map_err(|err| EngineError::InvalidConfig(format!("playback.remap.rules: {err}")))?;

        let store = LogStore::new(config.logs.clone());
        let log_path = store.log_path(&test);
        tracing::info!(
            test = %test.title,
            mode = %mode,
            log = %log_path.display(),
            "traffic replay mode resolved"
        );

        Ok(Self {
            config,
            test,
            requested_mode: mode,
            mode,
            store,
            log_path,
            record_filter,
            playback_filter,
            remapper,
            fell_back_to_record: false,
            session: Session::Inactive,
        })
    }

    /// Installs a caller-supplied remap that runs before the configured ones.
    pub fn with_url_remapper(mut self, remap: RemapFn) -> Self {
        self.remapper = self.remapper.with_custom(remap);
        self
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.session, Session::Inactive)
    }

    pub async fn setup(&mut self, target: &mut dyn InterceptionTarget) -> Result<(), EngineError> {
        if self.is_active() {
            return Err(EngineError::AlreadyActive {
                path: self.log_path.clone(),
            });
        }
        self.mode = self.requested_mode;
        self.fell_back_to_record = false;

        if self.mode == Mode::Disabled {
            tracing::debug!(test = %self.test.title, "traffic replay disabled; not intercepting");
            self.session = Session::Disabled;
            return Ok(());
        }

        self.store.ensure_parent_dir(&self.log_path).await?;
        let lock = LogLock::acquire(&self.log_path, self.config.lock).await?;

        self.session = match self.mode {
            Mode::Record => self.start_recording(target, lock)?,
            _ => self.start_playback(target, lock).await?,
        };
        Ok(())
    }

    fn start_recording(
        &mut self,
        target: &mut dyn InterceptionTarget,
        lock: LogLock,
    ) -> Result<Session, EngineError> {
        let effective = self.config.effective(Mode::Record);
        let mut recorder = Recorder::new(
            self.log_path.clone(),
            CaptureOptions {
                embed_bodies: effective.embed_bodies,
                body_capture: effective.body_capture,
            },
            self.record_filter.clone(),
        )
        .with_page(self.test.title.clone());

        // On error the lock drops here and is released.
        recorder.setup(target)?;
        tracing::info!(log = %self.log_path.display(), "recording traffic");
        Ok(Session::Recording { recorder, lock })
    }

    async fn start_playback(
        &mut self,
        target: &mut dyn InterceptionTarget,
        lock: LogLock,
    ) -> Result<Session, EngineError> {
        let reason = match self.store.validate(&self.log_path).await {
            LogValidation::Valid { .. } => {
                let document = self.store.load(&self.log_path).await?;
                let effective = self.config.effective(Mode::Playback);
                let mut player = Player::new(
                    self.log_path.clone(),
                    document,
                    PlayerOptions {
                        remapper: self.remapper.clone(),
                        match_query: effective.match_query,
                        fallback: effective.playback_fallback,
                        filter: self.playback_filter.clone(),
                        stateful_mock: effective.stateful_mock,
                    },
                );
                player.setup(target)?;
                tracing::info!(
                    log = %self.log_path.display(),
                    entries = player.entry_count(),
                    "replaying traffic"
                );
                return Ok(Session::Playing { player, lock });
            }
            LogValidation::Missing => "log does not exist".to_owned(),
            LogValidation::Invalid(reason) => reason,
        };

        if self.config.auto_record_fallback {
            tracing::warn!(
                log = %self.log_path.display(),
                "no usable log for playback ({reason}); recording instead"
            );
            self.mode = Mode::Record;
            self.fell_back_to_record = true;
            return self.start_recording(target, lock);
        }

        if self.config.effective(Mode::Playback).playback_fallback {
            tracing::warn!(
                log = %self.log_path.display(),
                "no usable log for playback ({reason}); serving live traffic"
            );
            return Ok(Session::Live { lock, reason });
        }

        lock.release();
        Err(EngineError::LogUnavailable {
            path: self.log_path.clone(),
            reason,
        })
    }

    /// Flushes what was recorded and releases the lock. A no-op when not
    /// active.
    pub async fn cleanup(&mut self) -> Result<(), EngineError> {
        match std::mem::replace(&mut self.session, Session::Inactive) {
            Session::Inactive | Session::Disabled => Ok(()),
            Session::Recording { mut recorder, lock } => {
                let flushed = recorder.cleanup(&self.store).await;
                lock.release();
                flushed.map(|_| ())
            }
            Session::Playing { mut player, lock } => {
                player.cleanup();
                lock.release();
                Ok(())
            }
            Session::Live { lock, .. } => {
                lock.release();
                Ok(())
            }
        }
    }

    pub fn context(&self) -> EngineContext {
        EngineContext {
            mode: self.mode,
            log_path: self.log_path.clone(),
            is_active: self.is_active(),
            effective_config: self.config.effective(self.mode),
            fell_back_to_record: self.fell_back_to_record,
        }
    }

    pub async fn stats(&self) -> LogStats {
        self.store.stats(&self.log_path).await
    }

    pub fn status_message(&self) -> String {
        let path = self.log_path.display();
        match &self.session {
            Session::Inactive => format!("{} mode, inactive ({path})", self.mode),
            Session::Disabled => "traffic replay disabled".to_owned(),
            Session::Recording { recorder, .. } if self.fell_back_to_record => format!(
                "recording to {path} ({} exchanges so far; no usable log for playback)",
                recorder.entry_count()
            ),
            Session::Recording { recorder, .. } => format!(
                "recording to {path} ({} exchanges so far)",
                recorder.entry_count()
            ),
            Session::Playing { player, .. } => {
                let mocked = player.mocked_collections();
                if mocked.is_empty() {
                    format!("replaying {} exchanges from {path}", player.entry_count())
                } else {
                    format!(
                        "replaying {} exchanges from {path} (stateful: {})",
                        player.entry_count(),
                        mocked.join(", ")
                    )
                }
            }
            Session::Live { reason, .. } => {
                format!("playback log {path} unavailable ({reason}); serving live traffic")
            }
        }
    }
}
