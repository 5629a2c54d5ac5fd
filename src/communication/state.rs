//! Sending state machine.
//!
//! Each state runs to completion on the sender thread and yields the next
//! state. Every sleep goes through the context so a shutdown request cuts
//! it short; an interrupted state moves straight to its shutdown state.

use std::fmt;
use std::time::Duration;

use log::{debug, info, warn};

use super::context::SendingContext;
use crate::protocol::StatusResponse;
use crate::util::millis;

/// Status request retries after the first attempt, in Init and CaptureOff.
pub const MAX_INITIAL_STATUS_REQUEST_RETRIES: u32 = 5;
/// Fixed pause between two status request attempts.
pub const INITIAL_RETRY_SLEEP_TIME: Duration = Duration::from_secs(1);
/// Pauses between two failed Init rounds; the last one repeats.
pub const REINIT_DELAYS: [Duration; 5] = [
    Duration::from_secs(60),
    Duration::from_secs(5 * 60),
    Duration::from_secs(15 * 60),
    Duration::from_secs(60 * 60),
    Duration::from_secs(2 * 60 * 60),
];
/// Interval between status checks while capturing is off.
pub const STATUS_CHECK_INTERVAL_MS: i64 = 2 * 60 * 60 * 1000;
/// Pause between two CaptureOn cycles.
pub const DEFAULT_SLEEP_TIME: Duration = Duration::from_secs(1);

/// Successful samples collected per time sync.
pub const REQUIRED_TIME_SYNC_REQUESTS: usize = 5;
/// Consecutive failed time sync requests tolerated before giving up.
pub const TIME_SYNC_RETRY_COUNT: u32 = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendingState {
    /// Fetch the initial configuration from the backend.
    Init { reinit_delay_index: usize },
    /// Estimate the offset between local and cluster time.
    TimeSync { initial: bool },
    /// Periodically send finished and open sessions.
    CaptureOn,
    /// Capturing disabled; poll the backend until it is enabled again.
    /// `sleep_time` overrides the pause before the next status check.
    CaptureOff { sleep_time: Option<Duration> },
    /// Send everything left before terminating.
    Flush,
    Terminal,
}

/// A sleep was cut short by a shutdown request.
struct Interrupted;

type Step = Result<SendingState, Interrupted>;

impl SendingState {
    pub fn initial() -> Self {
        SendingState::Init { reinit_delay_index: 0 }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SendingState::Init { .. }       => "Init",
            SendingState::TimeSync { .. }   => "TimeSync",
            SendingState::CaptureOn         => "CaptureOn",
            SendingState::CaptureOff { .. } => "CaptureOff",
            SendingState::Flush             => "Flush",
            SendingState::Terminal          => "Terminal",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SendingState::Terminal)
    }

    /// The state to continue with once shutdown has been requested.
    pub fn shutdown_state(&self) -> SendingState {
        match self {
            SendingState::Init { .. }
            | SendingState::TimeSync { initial: true }
            | SendingState::Flush
            | SendingState::Terminal => SendingState::Terminal,
            _ => SendingState::Flush,
        }
    }

    /// Run this state once and return the state to continue with.
    pub fn execute(mut self, ctx: &SendingContext) -> SendingState {
        let next = match self.run(ctx) {
            Ok(next) => next,
            Err(Interrupted) => {
                debug!("{self} interrupted by shutdown");
                self.on_interrupted(ctx);
                ctx.request_shutdown();
                return self.shutdown_state();
            }
        };

        if ctx.is_shutdown_requested() {
            return self.shutdown_state();
        }
        if matches!(self, SendingState::TimeSync { initial: true }) {
            // from here on a shutdown passes through Flush
            ctx.init_completed(true);
        }
        if next != self {
            debug!("sending state {self} -> {next}");
        }
        next
    }

    fn on_interrupted(&self, ctx: &SendingContext) {
        if matches!(self, SendingState::Init { .. } | SendingState::TimeSync { initial: true }) {
            ctx.init_completed(false);
        }
    }

    fn run(&mut self, ctx: &SendingContext) -> Step {
        match self {
            SendingState::Init { reinit_delay_index } => run_init(ctx, reinit_delay_index),
            SendingState::TimeSync { initial }        => run_time_sync(ctx, *initial),
            SendingState::CaptureOn                   => run_capture_on(ctx),
            SendingState::CaptureOff { sleep_time }   => run_capture_off(ctx, *sleep_time),
            SendingState::Flush                       => Ok(run_flush(ctx)),
            SendingState::Terminal => {
                ctx.request_shutdown();
                Ok(SendingState::Terminal)
            }
        }
    }
}

impl fmt::Display for SendingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

fn pause(ctx: &SendingContext, duration: Duration) -> Result<(), Interrupted> {
    if ctx.sleep(duration) { Ok(()) } else { Err(Interrupted) }
}

/// Send a status request, retrying `retries` times with a fixed pause.
fn send_status_request(
    ctx:     &SendingContext,
    retries: u32,
    delay:   Duration,
) -> Result<Option<StatusResponse>, Interrupted> {
    let mut attempt = 0;
    loop {
        let resp = ctx.http().send_status_request(ctx.server_id());
        if resp.is_some() || attempt >= retries || ctx.is_shutdown_requested() {
            return Ok(resp);
        }
        attempt += 1;
        pause(ctx, delay)?;
    }
}

/// CaptureOn or CaptureOff, depending on the current settings.
fn capture_state(ctx: &SendingContext) -> SendingState {
    if ctx.is_capture_on() {
        SendingState::CaptureOn
    } else {
        SendingState::CaptureOff { sleep_time: None }
    }
}

// ── Init ──────────────────────────────────────────────────────────────────────

fn run_init(ctx: &SendingContext, reinit_delay_index: &mut usize) -> Step {
    loop {
        if ctx.is_shutdown_requested() {
            return Ok(SendingState::Terminal);
        }

        let now = ctx.current_timestamp();
        ctx.set_last_open_session_send_time(now);
        ctx.set_last_status_check_time(now);

        let resp = send_status_request(ctx, MAX_INITIAL_STATUS_REQUEST_RETRIES, INITIAL_RETRY_SLEEP_TIME)?;
        if let Some(resp) = resp {
            ctx.handle_status_response(&resp);
            info!("initial status request succeeded, capture={}", ctx.is_capture_on());
            return Ok(SendingState::TimeSync { initial: true });
        }
        if ctx.is_shutdown_requested() {
            return Ok(SendingState::Terminal);
        }

        let delay = REINIT_DELAYS[*reinit_delay_index];
        warn!("initial status request failed, retrying in {delay:?}");
        pause(ctx, delay)?;
        *reinit_delay_index = (*reinit_delay_index + 1).min(REINIT_DELAYS.len() - 1);
    }
}

// ── TimeSync ──────────────────────────────────────────────────────────────────

fn run_time_sync(ctx: &SendingContext, initial: bool) -> Step {
    let offsets = collect_time_sync_offsets(ctx)?;

    if offsets.len() < REQUIRED_TIME_SYNC_REQUESTS {
        if ctx.is_shutdown_requested() {
            return Ok(capture_state(ctx));
        }
        warn!("time sync failed after {} samples, disabling capture", offsets.len());
        ctx.disable_capture();
        return Ok(SendingState::CaptureOff { sleep_time: None });
    }

    let offset = cluster_time_offset(&offsets);
    debug!("time sync complete, cluster time offset {offset}ms");
    ctx.settings().set_cluster_time_offset(offset);
    ctx.set_last_time_sync_time(ctx.current_timestamp());
    Ok(capture_state(ctx))
}

fn collect_time_sync_offsets(ctx: &SendingContext) -> Result<Vec<i64>, Interrupted> {
    let mut offsets = Vec::with_capacity(REQUIRED_TIME_SYNC_REQUESTS);
    let mut retry = 0;
    let mut sleep = INITIAL_RETRY_SLEEP_TIME;

    while offsets.len() < REQUIRED_TIME_SYNC_REQUESTS && !ctx.is_shutdown_requested() {
        let send_time = ctx.current_timestamp();
        match ctx.http().send_time_sync_request(ctx.server_id()) {
            Some(resp) => {
                let receive_time = ctx.current_timestamp();
                let offset = (i128::from(resp.request_receive_time) - i128::from(send_time)
                    + i128::from(resp.response_send_time)
                    - i128::from(receive_time))
                    / 2;
                offsets.push(saturate(offset));
                retry = 0;
                sleep = INITIAL_RETRY_SLEEP_TIME;
            }
            None if retry < TIME_SYNC_RETRY_COUNT => {
                pause(ctx, sleep)?;
                sleep *= 2;
                retry += 1;
            }
            None => break,
        }
    }
    Ok(offsets)
}

/// Mean of the samples within one standard deviation of the median.
fn cluster_time_offset(offsets: &[i64]) -> i64 {
    let mut sorted = offsets.to_vec();
    sorted.sort_unstable();
    let Some(&median) = sorted.get(sorted.len() / 2) else {
        return 0;
    };

    let n = sorted.len() as f64;
    let mean = sum(&sorted) as f64 / n;
    let std_dev = (sorted.iter().map(|&o| (o as f64 - mean).powi(2)).sum::<f64>() / n).sqrt();

    let kept: Vec<i64> = sorted
        .iter()
        .copied()
        .filter(|&o| ((i128::from(o) - i128::from(median)) as f64).abs() <= std_dev)
        .collect();
    if kept.is_empty() {
        return median;
    }
    let n = kept.len() as i128;
    saturate((2 * sum(&kept) + n).div_euclid(2 * n))
}

fn sum(values: &[i64]) -> i128 {
    values.iter().copied().map(i128::from).sum()
}

fn saturate(value: i128) -> i64 {
    i64::try_from(value).unwrap_or(if value < 0 { i64::MIN } else { i64::MAX })
}

// ── CaptureOn ─────────────────────────────────────────────────────────────────

fn run_capture_on(ctx: &SendingContext) -> Step {
    pause(ctx, DEFAULT_SLEEP_TIME)?;

    let mut last_response = None;

    for session in ctx.finished_sessions() {
        let resp = ctx.send_session(&session);
        if session.beacon().is_empty() {
            ctx.forget_finished_session(&session);
        } else if resp.is_none() {
            // backend unreachable, retry next cycle
            break;
        }
        if resp.is_some() {
            last_response = resp;
        }
    }

    let now = ctx.current_timestamp();
    if now - ctx.last_open_session_send_time() >= ctx.send_interval_ms() {
        for session in ctx.open_sessions() {
            if let Some(resp) = ctx.send_session(&session) {
                last_response = Some(resp);
            }
        }
        ctx.set_last_open_session_send_time(now);
    }

    if let Some(resp) = last_response {
        ctx.handle_status_response(&resp);
        if !ctx.is_capture_on() {
            return Ok(SendingState::CaptureOff { sleep_time: None });
        }
    }

    if ctx.is_time_sync_required() {
        return Ok(SendingState::TimeSync { initial: false });
    }
    Ok(SendingState::CaptureOn)
}

// ── CaptureOff ────────────────────────────────────────────────────────────────

fn run_capture_off(ctx: &SendingContext, sleep_time: Option<Duration>) -> Step {
    ctx.disable_capture();

    let now = ctx.current_timestamp();
    let delay = sleep_time
        .unwrap_or_else(|| millis(STATUS_CHECK_INTERVAL_MS - (now - ctx.last_status_check_time())));
    if !delay.is_zero() {
        pause(ctx, delay)?;
    }

    let resp = send_status_request(ctx, MAX_INITIAL_STATUS_REQUEST_RETRIES, INITIAL_RETRY_SLEEP_TIME)?;
    ctx.set_last_status_check_time(ctx.current_timestamp());

    let Some(resp) = resp else {
        return Ok(SendingState::CaptureOff { sleep_time: None });
    };
    ctx.handle_status_response(&resp);
    if !ctx.is_capture_on() {
        return Ok(SendingState::CaptureOff { sleep_time: None });
    }
    if ctx.is_time_sync_required() {
        return Ok(SendingState::TimeSync { initial: false });
    }
    Ok(SendingState::CaptureOn)
}

// ── Flush ─────────────────────────────────────────────────────────────────────

fn run_flush(ctx: &SendingContext) -> SendingState {
    for session in ctx.open_sessions() {
        session.end();
    }
    for session in ctx.finished_sessions() {
        ctx.send_session(&session);
        ctx.forget_finished_session(&session);
    }
    SendingState::Terminal
}
