use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub log_format: LogFormat,
    pub order_queue_size: usize,
    pub event_buffer_size: usize,
    pub ledger_journal_path: Option<PathBuf>,
    pub dispatch: DispatchPolicy,
    pub batching: BatchPolicy,
    pub session: SessionPolicy,
}

/// Matching, offer and retry policy. The numbers are tuning placeholders.
#[derive(Debug, Clone)]
pub struct DispatchPolicy {
    pub workers: usize,
    pub candidate_limit: usize,
    pub initial_radius_km: f64,
    pub max_radius_km: f64,
    pub offer_ttl: Duration,
    pub max_offer_attempts: u32,
    pub no_candidate_backoff: Duration,
    pub grid_cell_deg: f64,
}

#[derive(Debug, Clone)]
pub struct BatchPolicy {
    pub pickup_tolerance_km: f64,
    pub window: Duration,
    pub max_batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct SessionPolicy {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    pub outbound_buffer_size: usize,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        Self {
            workers: 4,
            candidate_limit: 5,
            initial_radius_km: 2.0,
            max_radius_km: 8.0,
            offer_ttl: Duration::from_millis(20_000),
            max_offer_attempts: 5,
            no_candidate_backoff: Duration::from_millis(2_000),
            grid_cell_deg: 0.01,
        }
    }
}

impl Default for BatchPolicy {
    fn default() -> Self {
        Self {
            pickup_tolerance_km: 0.05,
            window: Duration::from_millis(300_000),
            max_batch_size: 3,
        }
    }
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_millis(10_000),
            heartbeat_timeout: Duration::from_millis(30_000),
            outbound_buffer_size: 64,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            log_format: LogFormat::Compact,
            order_queue_size: 1024,
            event_buffer_size: 1024,
            ledger_journal_path: None,
            dispatch: DispatchPolicy::default(),
            batching: BatchPolicy::default(),
            session: SessionPolicy::default(),
        }
    }
}

impl DispatchPolicy {
    /// Radius for the next pass after a pass found no candidates: doubles up to the cap.
    pub fn widen(&self, radius_km: f64) -> f64 {
        (radius_km * 2.0).min(self.max_radius_km)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.workers == 0 {
            return Err(AppError::Internal("DISPATCH_WORKERS must be > 0".to_string()));
        }
        if self.candidate_limit == 0 {
            return Err(AppError::Internal("CANDIDATE_LIMIT must be > 0".to_string()));
        }
        if !(self.initial_radius_km > 0.0) {
            return Err(AppError::Internal("INITIAL_RADIUS_KM must be > 0".to_string()));
        }
        if self.max_radius_km < self.initial_radius_km {
            return Err(AppError::Internal(
                "MAX_RADIUS_KM must be >= INITIAL_RADIUS_KM".to_string(),
            ));
        }
        if self.offer_ttl.is_zero() {
            return Err(AppError::Internal("OFFER_TTL_MS must be > 0".to_string()));
        }
        if self.max_offer_attempts == 0 {
            return Err(AppError::Internal("MAX_OFFER_ATTEMPTS must be >= 1".to_string()));
        }
        if !(self.grid_cell_deg > 0.0) {
            return Err(AppError::Internal("GRID_CELL_DEG must be > 0".to_string()));
        }
        Ok(())
    }
}

impl SessionPolicy {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.heartbeat_interval.is_zero() {
            return Err(AppError::Internal("HEARTBEAT_INTERVAL_MS must be > 0".to_string()));
        }
        if self.heartbeat_timeout <= self.heartbeat_interval {
            return Err(AppError::Internal(
                "HEARTBEAT_TIMEOUT_MS must exceed HEARTBEAT_INTERVAL_MS".to_string(),
            ));
        }
        Ok(())
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Config::default();

        let log_format = match env::var("LOG_FORMAT") {
            Ok(raw) if raw.eq_ignore_ascii_case("json") => LogFormat::Json,
            Ok(raw) if raw.eq_ignore_ascii_case("compact") => LogFormat::Compact,
            Ok(raw) => {
                return Err(AppError::Internal(format!(
                    "invalid LOG_FORMAT: {raw}, expected compact or json"
                )));
            }
            Err(_) => defaults.log_format,
        };

        let dispatch = DispatchPolicy {
            workers: parse_or_default("DISPATCH_WORKERS", defaults.dispatch.workers)?,
            candidate_limit: parse_or_default("CANDIDATE_LIMIT", defaults.dispatch.candidate_limit)?,
            initial_radius_km: parse_or_default(
                "INITIAL_RADIUS_KM",
                defaults.dispatch.initial_radius_km,
            )?,
            max_radius_km: parse_or_default("MAX_RADIUS_KM", defaults.dispatch.max_radius_km)?,
            offer_ttl: millis_or_default("OFFER_TTL_MS", defaults.dispatch.offer_ttl)?,
            max_offer_attempts: parse_or_default(
                "MAX_OFFER_ATTEMPTS",
                defaults.dispatch.max_offer_attempts,
            )?,
            no_candidate_backoff: millis_or_default(
                "NO_CANDIDATE_BACKOFF_MS",
                defaults.dispatch.no_candidate_backoff,
            )?,
            grid_cell_deg: parse_or_default("GRID_CELL_DEG", defaults.dispatch.grid_cell_deg)?,
        };
        dispatch.validate()?;

        let batching = BatchPolicy {
            pickup_tolerance_km: parse_or_default(
                "BATCH_PICKUP_TOLERANCE_KM",
                defaults.batching.pickup_tolerance_km,
            )?,
            window: millis_or_default("BATCH_WINDOW_MS", defaults.batching.window)?,
            max_batch_size: parse_or_default("MAX_BATCH_SIZE", defaults.batching.max_batch_size)?,
        };
        if batching.max_batch_size == 0 {
            return Err(AppError::Internal("MAX_BATCH_SIZE must be >= 1".to_string()));
        }

        let session = SessionPolicy {
            heartbeat_interval: millis_or_default(
                "HEARTBEAT_INTERVAL_MS",
                defaults.session.heartbeat_interval,
            )?,
            heartbeat_timeout: millis_or_default(
                "HEARTBEAT_TIMEOUT_MS",
                defaults.session.heartbeat_timeout,
            )?,
            outbound_buffer_size: parse_or_default(
                "OUTBOUND_BUFFER_SIZE",
                defaults.session.outbound_buffer_size,
            )?,
        };
        session.validate()?;

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            log_format,
            order_queue_size: parse_or_default("ORDER_QUEUE_SIZE", defaults.order_queue_size)?,
            event_buffer_size: parse_or_default("EVENT_BUFFER_SIZE", defaults.event_buffer_size)?,
            ledger_journal_path: env::var("LEDGER_JOURNAL_PATH").ok().map(PathBuf::from),
            dispatch,
            batching,
            session,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

fn millis_or_default(key: &str, default: Duration) -> Result<Duration, AppError> {
    let millis = parse_or_default(key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{DispatchPolicy, SessionPolicy};

    #[test]
    fn radius_doubles_up_to_cap() {
        let policy = DispatchPolicy::default();
        let mut radius = policy.initial_radius_km;
        let mut seen = vec![radius];
        for _ in 0..4 {
            radius = policy.widen(radius);
            seen.push(radius);
        }
        assert_eq!(seen, vec![2.0, 4.0, 8.0, 8.0, 8.0]);
    }

    #[test]
    fn default_policy_is_valid() {
        assert!(DispatchPolicy::default().validate().is_ok());
    }

    #[test]
    fn cap_below_initial_radius_is_rejected() {
        let policy = DispatchPolicy {
            initial_radius_km: 4.0,
            max_radius_km: 2.0,
            ..DispatchPolicy::default()
        };
        assert!(policy.validate().is_err());
    }

    #[test]
    fn zero_heartbeat_interval_is_rejected() {
        assert!(SessionPolicy::default().validate().is_ok());

        let session = SessionPolicy {
            heartbeat_interval: Duration::ZERO,
            ..SessionPolicy::default()
        };
        assert!(session.validate().is_err());

        let session = SessionPolicy {
            heartbeat_interval: Duration::from_secs(30),
            heartbeat_timeout: Duration::from_secs(30),
            ..SessionPolicy::default()
        };
        assert!(session.validate().is_err());
    }
}
