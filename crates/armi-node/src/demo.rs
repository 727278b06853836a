//! Demo services and publishers: a world clock, a hub-management service,
//! and a periodic clock-tick publisher. Registered by the CLI's `start
//! --demo` and reused by the integration tests.

use std::sync::Arc;
use std::time::Duration;

use armi_protocol::Value;
use chrono::{FixedOffset, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::hub::{Hub, TypedPayload};
use crate::service::{string_arg, ServiceDescriptor};

/// Line terminator per O/S, matching what `getTime` appends.
pub const OS_EOL: &str = if cfg!(windows) { "\r\n" } else { "\n" };

const DONE: &str = "Done.";
const DENY: &str = "Permission denied.";
const HELLO: &str = "Hi!  Nice talking with you.";

/// Grace period between a granted shutdown call and the actual tear-down,
/// so the response still reaches the caller.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(2500);

/// Payload published by [`spawn_date_publisher`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClockTick {
    pub unix_ms: i64,
}

impl TypedPayload for ClockTick {
    const DATA_TYPE: &'static str = "armi.demo.ClockTick";
}

/// A service providing the current time in given time zones.
///
/// `getTime(tz)` returns `"HH:MM <zone>"` plus the O/S line terminator;
/// `getTimes(tz, ...)` concatenates one line per zone and accepts zero
/// zones, returning the empty string. Zones are `"UTC"`, `"GMT"`, or
/// GMT-prefixed fixed offsets like `"GMT+5"`, echoed back in the canonical
/// zero-padded `"GMT+05:00"` form; any other id falls back to GMT.
pub fn world_clock_service() -> Arc<ServiceDescriptor> {
    Arc::new(
        ServiceDescriptor::new()
            .method("getTime", 1, |args| {
                Ok(Value::Str(time_in_zone(string_arg(&args, 0)?)))
            })
            .variadic_method("getTimes", 0, |args| {
                let mut out = String::new();
                for (i, _) in args.iter().enumerate() {
                    out.push_str(&time_in_zone(string_arg(&args, i)?));
                }
                Ok(Value::Str(out))
            }),
    )
}

fn time_in_zone(tz: &str) -> String {
    let (offset, id) = parse_zone(tz);
    let now = Utc::now().with_timezone(&offset);
    format!("{:02}:{:02} {}{}", now.hour(), now.minute(), id, OS_EOL)
}

/// Parse a zone name into a fixed offset and the id echoed back to the
/// caller. Only `UTC`, `GMT`, and `GMT<sign><offset>` ids are understood;
/// anything else falls back to plain GMT.
fn parse_zone(tz: &str) -> (FixedOffset, String) {
    let gmt = FixedOffset::east_opt(0).expect("zero offset");
    let upper = tz.to_ascii_uppercase();
    if upper == "UTC" || upper == "GMT" {
        return (gmt, upper);
    }
    if let Some(rest) = upper.strip_prefix("GMT") {
        if let Some(parsed) = parse_custom_offset(rest) {
            return parsed;
        }
    }
    (gmt, "GMT".to_owned())
}

/// Custom offset after the GMT prefix: `+H`, `-HH:MM`, or `+HHMM`. The
/// echoed id is always the canonical zero-padded `GMT+HH:MM` form, not the
/// caller's spelling.
fn parse_custom_offset(s: &str) -> Option<(FixedOffset, String)> {
    let (sign, rest) = match s.bytes().next()? {
        b'+' => (1, &s[1..]),
        b'-' => (-1, &s[1..]),
        _ => return None,
    };
    if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit() || b == b':') {
        return None;
    }
    let (hours, minutes) = match rest.split_once(':') {
        Some((h, m)) => (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?),
        // a bare run of 3+ digits reads as hhmm
        None if rest.len() > 2 => {
            let (h, m) = rest.split_at(rest.len() - 2);
            (h.parse::<i32>().ok()?, m.parse::<i32>().ok()?)
        }
        None => (rest.parse::<i32>().ok()?, 0),
    };
    if !(0..24).contains(&hours) || !(0..60).contains(&minutes) {
        return None;
    }
    let offset = FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))?;
    let sign_ch = if sign < 0 { '-' } else { '+' };
    Some((offset, format!("GMT{sign_ch}{hours:02}:{minutes:02}")))
}

/// The hub-management service, registered as `"Server"` by the CLI.
///
/// `shutdown` only proceeds when the configured password matches the one
/// supplied (or neither side has one); otherwise it answers
/// `"Permission denied."` and the hub keeps running.
pub fn server_service(hub: Hub, password: Option<String>) -> Arc<ServiceDescriptor> {
    let pw = Arc::new(password);
    let list_hub = hub.clone();
    let subs_hub = hub.clone();
    let stop0_hub = hub.clone();
    let stop0_pw = pw.clone();
    let stop1_hub = hub;
    let stop1_pw = pw;

    Arc::new(
        ServiceDescriptor::new()
            .method("hello", 0, |_| Ok(Value::Str(HELLO.into())))
            .method("hello", 1, |args| {
                Ok(Value::Str(format!(
                    "Who are you calling {}?  I am \"Mr. ARMI\" to you!",
                    string_arg(&args, 0)?
                )))
            })
            .async_method("listServices", 0, move |_| {
                let hub = list_hub.clone();
                Box::pin(async move {
                    Ok(Value::List(
                        hub.service_names().await.into_iter().map(Value::Str).collect(),
                    ))
                })
            })
            .async_method("listSubscriptions", 0, move |_| {
                let hub = subs_hub.clone();
                Box::pin(async move {
                    Ok(Value::List(
                        hub.subscription_descriptions()
                            .await
                            .into_iter()
                            .map(Value::Str)
                            .collect(),
                    ))
                })
            })
            .method("shutdown", 0, move |_| {
                Ok(request_shutdown(stop0_hub.clone(), stop0_pw.as_deref(), None))
            })
            .method("shutdown", 1, move |args| {
                let given = string_arg(&args, 0)?.to_owned();
                Ok(request_shutdown(stop1_hub.clone(), stop1_pw.as_deref(), Some(&given)))
            }),
    )
}

fn request_shutdown(hub: Hub, configured: Option<&str>, given: Option<&str>) -> Value {
    if !password_ok(configured, given) {
        return Value::Str(DENY.into());
    }
    tracing::info!("shutdown requested via Server service");
    tokio::spawn(async move {
        tokio::time::sleep(SHUTDOWN_GRACE).await;
        hub.shutdown().await;
    });
    Value::Str(DONE.into())
}

fn password_ok(configured: Option<&str>, given: Option<&str>) -> bool {
    match (configured, given) {
        (None, None) => true,
        (Some(c), Some(g)) => c == g,
        _ => false,
    }
}

/// Publish a [`ClockTick`] under the given flavor every `interval`, until
/// the returned task is aborted.
pub fn spawn_date_publisher(
    hub: Hub,
    interval: Duration,
    flavor: impl Into<String>,
) -> tokio::task::JoinHandle<()> {
    let flavor = flavor.into();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await; // first tick is immediate; skip it
        loop {
            ticker.tick().await;
            let tick = ClockTick {
                unix_ms: Utc::now().timestamp_millis(),
            };
            if let Err(e) = hub.publish(&tick, Some(&flavor)).await {
                tracing::warn!(error = %e, "date publisher stopping");
                break;
            }
        }
    })
}
