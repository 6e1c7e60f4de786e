//! Host platform boundary
//!
//! The host delivers four callback families (app lifetime, download items,
//! download overview, power). Each family is reached through a
//! [`Subscribable`] capability whose `subscribe` hands back a [`CancelToken`];
//! the bridge never sees the concrete host SDK.
//!
//! Payloads arrive untyped. They are parsed here into explicit structs with
//! lenient coercion, so missing or wrong-typed fields turn into defaults
//! instead of reaching the state machine.

use crate::bridge::BridgeHandle;
use crate::error::{BridgeError, FaultKind, FaultReporter, Result};
use crate::events::AppId;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::io::BufRead;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Lenient field readers for untyped payloads
pub mod coerce {
    use serde_json::Value;

    pub fn as_i64(value: &Value) -> Option<i64> {
        match value {
            Value::Number(n) => n
                .as_i64()
                .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.round() as i64)),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn app_id(value: Option<&Value>) -> Option<u32> {
        value
            .and_then(as_i64)
            .filter(|id| *id > 0)
            .and_then(|id| u32::try_from(id).ok())
    }

    pub fn u64_or(value: Option<&Value>, default: u64) -> u64 {
        value
            .and_then(|v| match v {
                Value::Number(n) => n.as_u64().or_else(|| as_i64(v).map(|i| i.max(0) as u64)),
                _ => as_i64(v).map(|i| i.max(0) as u64),
            })
            .unwrap_or(default)
    }

    pub fn f64_or(value: Option<&Value>, default: f64) -> f64 {
        value
            .and_then(|v| match v {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .filter(|f| f.is_finite())
            .unwrap_or(default)
    }

    pub fn bool_or(value: Option<&Value>, default: bool) -> bool {
        match value {
            Some(Value::Bool(b)) => *b,
            Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0).unwrap_or(default),
            Some(Value::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" => true,
                "false" | "0" | "no" => false,
                _ => default,
            },
            _ => default,
        }
    }

    /// First of several aliases present on the object
    pub fn field<'a>(value: &'a Value, keys: &[&str]) -> Option<&'a Value> {
        keys.iter().find_map(|k| value.get(*k)).filter(|v| !v.is_null())
    }
}

use coerce::field;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppLifetimeNotification {
    pub app_id: AppId,
    pub running: bool,
}

impl AppLifetimeNotification {
    pub fn from_value(value: &Value) -> Self {
        Self {
            app_id: coerce::app_id(field(value, &["unAppID", "app_id", "appid"])).unwrap_or(0),
            running: coerce::bool_or(field(value, &["bRunning", "running"]), false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadItem {
    pub app_id: Option<AppId>,
    pub active: bool,
    pub completed: bool,
}

impl DownloadItem {
    pub fn from_value(value: &Value) -> Self {
        Self {
            app_id: coerce::app_id(field(value, &["appid", "app_id"])),
            active: coerce::bool_or(field(value, &["active"]), false),
            completed: coerce::bool_or(field(value, &["completed"]), false),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadItemsUpdate {
    pub is_downloading: bool,
    pub items: Vec<DownloadItem>,
}

impl DownloadItemsUpdate {
    pub fn from_value(value: &Value) -> Self {
        let items = field(value, &["items", "rgItems"])
            .and_then(|v| v.as_array())
            .map(|items| items.iter().map(DownloadItem::from_value).collect())
            .unwrap_or_default();
        Self {
            is_downloading: coerce::bool_or(
                field(value, &["isDownloading", "is_downloading"]),
                false,
            ),
            items,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOverview {
    pub app_id: Option<AppId>,
    pub bytes_downloaded: u64,
    pub bytes_to_download: u64,
    pub bytes_per_second: Option<u64>,
}

impl DownloadOverview {
    pub fn from_value(value: &Value) -> Self {
        Self {
            app_id: coerce::app_id(field(value, &["update_appid", "app_id"])),
            bytes_downloaded: coerce::u64_or(
                field(value, &["update_bytes_downloaded", "bytes_downloaded"]),
                0,
            ),
            bytes_to_download: coerce::u64_or(
                field(value, &["update_bytes_to_download", "bytes_to_download"]),
                0,
            ),
            bytes_per_second: field(
                value,
                &["update_network_bytes_per_second", "bytes_per_second"],
            )
            .map(|v| coerce::u64_or(Some(v), 0)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerNotification {
    Suspend,
    Resume,
    Shutdown,
}

impl PowerNotification {
    pub fn from_value(value: &Value) -> Option<Self> {
        let state = field(value, &["state", "event"])?.as_str()?;
        match state.to_ascii_lowercase().as_str() {
            "suspend" | "suspending" => Some(Self::Suspend),
            "resume" | "resuming" => Some(Self::Resume),
            "shutdown" | "shutting_down" => Some(Self::Shutdown),
            _ => None,
        }
    }
}

/// One raw callback, as queued to the bridge actor
#[derive(Debug, Clone, PartialEq)]
pub enum RawNotification {
    AppLifetime(AppLifetimeNotification),
    DownloadItems(DownloadItemsUpdate),
    DownloadOverview(DownloadOverview),
    Power(PowerNotification),
}

pub type Handler<E> = Box<dyn Fn(E) + Send + Sync>;

/// A callback family that can be subscribed to
pub trait Subscribable<E>: Send + Sync {
    fn subscribe(&self, handler: Handler<E>) -> Result<CancelToken>;
}

type Unregister = Box<dyn FnOnce() -> Result<()> + Send>;

/// Unregister handle for one subscription. Runs at most once: either through
/// [`CancelToken::cancel`] or, failing that, on drop.
pub struct CancelToken {
    family: &'static str,
    unregister: Option<Unregister>,
}

impl CancelToken {
    pub fn new(family: &'static str, unregister: impl FnOnce() -> Result<()> + Send + 'static) -> Self {
        Self {
            family,
            unregister: Some(Box::new(unregister)),
        }
    }

    pub fn family(&self) -> &'static str {
        self.family
    }

    pub fn cancel(mut self) -> Result<()> {
        match self.unregister.take() {
            Some(unregister) => unregister(),
            None => Ok(()),
        }
    }
}

impl Drop for CancelToken {
    fn drop(&mut self) {
        if let Some(unregister) = self.unregister.take() {
            if let Err(e) = unregister() {
                warn!(family = self.family, error = %e, "unregister on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("family", &self.family)
            .field("pending", &self.unregister.is_some())
            .finish()
    }
}

type SharedHandler<E> = Arc<dyn Fn(E) + Send + Sync>;

/// In-process callback family: handlers register here and `dispatch`
/// invokes all of them.
pub struct HandlerRegistry<E> {
    family: &'static str,
    next_id: AtomicU64,
    handlers: Arc<Mutex<HashMap<u64, SharedHandler<E>>>>,
}

impl<E: Clone> HandlerRegistry<E> {
    pub fn new(family: &'static str) -> Self {
        Self {
            family,
            next_id: AtomicU64::new(1),
            handlers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.lock().len()
    }

    pub fn dispatch(&self, event: E) {
        let handlers: Vec<_> = self.handlers.lock().values().cloned().collect();
        for handler in handlers {
            handler(event.clone());
        }
    }
}

impl<E: Clone + Send + 'static> Subscribable<E> for HandlerRegistry<E> {
    fn subscribe(&self, handler: Handler<E>) -> Result<CancelToken> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.handlers.lock().insert(id, Arc::from(handler));

        let handlers = Arc::clone(&self.handlers);
        let family = self.family;
        Ok(CancelToken::new(family, move || {
            match handlers.lock().remove(&id) {
                Some(_) => Ok(()),
                None => Err(BridgeError::Unsubscribe {
                    family: family.to_string(),
                    message: "handler already removed".into(),
                }),
            }
        }))
    }
}

/// The four callback families the bridge listens to
#[derive(Clone)]
pub struct PlatformHooks {
    pub app_lifetime: Arc<dyn Subscribable<AppLifetimeNotification>>,
    pub download_items: Arc<dyn Subscribable<DownloadItemsUpdate>>,
    pub download_overview: Arc<dyn Subscribable<DownloadOverview>>,
    pub power: Arc<dyn Subscribable<PowerNotification>>,
}

/// Live subscriptions. Call [`Subscriptions::shutdown`] once on exit.
#[derive(Debug)]
pub struct Subscriptions {
    tokens: Vec<CancelToken>,
    faults: FaultReporter,
}

impl Subscriptions {
    pub fn families(&self) -> Vec<&'static str> {
        self.tokens.iter().map(CancelToken::family).collect()
    }

    /// Unregister every family. A failing unregister is logged and does not
    /// stop the rest; returns how many failed.
    pub fn shutdown(self) -> usize {
        let mut failures = 0;
        for token in self.tokens {
            let family = token.family();
            match token.cancel() {
                Ok(()) => debug!(family, "unregistered"),
                Err(e) => {
                    failures += 1;
                    self.faults
                        .report(FaultKind::Unsubscribe, format!("{}: {}", family, e));
                }
            }
        }
        failures
    }
}

fn subscribe_family<E: 'static>(
    family: &'static str,
    source: &dyn Subscribable<E>,
    handle: &BridgeHandle,
    wrap: fn(E) -> RawNotification,
    tokens: &mut Vec<CancelToken>,
) {
    let sink = handle.clone();
    let handler: Handler<E> = Box::new(move |event| sink.notify_raw(wrap(event)));
    match source.subscribe(handler) {
        Ok(token) => tokens.push(token),
        Err(e) => handle.fault_reporter().report(
            FaultKind::SubscriptionSetup,
            format!("{}: {}", family, e),
        ),
    }
}

/// Route every callback family into the bridge. A family whose subscription
/// fails is skipped; the others keep working.
pub fn attach(hooks: &PlatformHooks, handle: &BridgeHandle) -> Subscriptions {
    let mut tokens = Vec::with_capacity(4);
    subscribe_family(
        "app_lifetime",
        hooks.app_lifetime.as_ref(),
        handle,
        RawNotification::AppLifetime,
        &mut tokens,
    );
    subscribe_family(
        "download_items",
        hooks.download_items.as_ref(),
        handle,
        RawNotification::DownloadItems,
        &mut tokens,
    );
    subscribe_family(
        "download_overview",
        hooks.download_overview.as_ref(),
        handle,
        RawNotification::DownloadOverview,
        &mut tokens,
    );
    subscribe_family(
        "power",
        hooks.power.as_ref(),
        handle,
        RawNotification::Power,
        &mut tokens,
    );
    info!("Subscribed to {} platform notification families", tokens.len());

    Subscriptions {
        tokens,
        faults: handle.fault_reporter().clone(),
    }
}

/// Callback registries fed from newline-delimited JSON, e.g. a host helper
/// writing to our stdin:
///
/// ```text
/// {"family":"app_lifetime","unAppID":730,"bRunning":true}
/// {"family":"download_items","isDownloading":true,"items":[{"appid":10,"active":true}]}
/// {"family":"download_overview","update_appid":10,"update_bytes_downloaded":5,"update_bytes_to_download":10}
/// {"family":"power","state":"suspend"}
/// ```
pub struct JsonLinesPlatform {
    app_lifetime: Arc<HandlerRegistry<AppLifetimeNotification>>,
    download_items: Arc<HandlerRegistry<DownloadItemsUpdate>>,
    download_overview: Arc<HandlerRegistry<DownloadOverview>>,
    power: Arc<HandlerRegistry<PowerNotification>>,
}

impl Default for JsonLinesPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl JsonLinesPlatform {
    pub fn new() -> Self {
        Self {
            app_lifetime: Arc::new(HandlerRegistry::new("app_lifetime")),
            download_items: Arc::new(HandlerRegistry::new("download_items")),
            download_overview: Arc::new(HandlerRegistry::new("download_overview")),
            power: Arc::new(HandlerRegistry::new("power")),
        }
    }

    pub fn hooks(&self) -> PlatformHooks {
        PlatformHooks {
            app_lifetime: self.app_lifetime.clone(),
            download_items: self.download_items.clone(),
            download_overview: self.download_overview.clone(),
            power: self.power.clone(),
        }
    }

    /// Parse and dispatch one line. Blank lines are ignored.
    pub fn dispatch_line(&self, line: &str) -> Result<()> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(());
        }

        let value: Value = serde_json::from_str(line)?;
        match value.get("family").and_then(Value::as_str) {
            Some("app_lifetime") => self
                .app_lifetime
                .dispatch(AppLifetimeNotification::from_value(&value)),
            Some("download_items") => self
                .download_items
                .dispatch(DownloadItemsUpdate::from_value(&value)),
            Some("download_overview") => self
                .download_overview
                .dispatch(DownloadOverview::from_value(&value)),
            Some("power") => match PowerNotification::from_value(&value) {
                Some(n) => self.power.dispatch(n),
                None => debug!("unrecognised power notification: {}", line),
            },
            other => debug!("ignoring notification with family {:?}", other),
        }
        Ok(())
    }

    /// Read lines until EOF. Blocks; run it on its own thread. Only a read
    /// failure ends the feed early; undecodable lines are skipped.
    pub fn run<R: BufRead>(&self, mut reader: R) -> Result<()> {
        let mut buf = Vec::new();
        loop {
            buf.clear();
            if reader.read_until(b'\n', &mut buf)? == 0 {
                break;
            }
            let line = match std::str::from_utf8(&buf) {
                Ok(line) => line,
                Err(e) => {
                    warn!(error = %e, "platform notification is not UTF-8");
                    continue;
                }
            };
            if let Err(e) = self.dispatch_line(line) {
                warn!(error = %e, "malformed platform notification");
            }
        }
        info!("Platform notification feed closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_app_lifetime_aliases() {
        let steam = AppLifetimeNotification::from_value(&json!({ "unAppID": 730, "bRunning": true }));
        assert_eq!(steam, AppLifetimeNotification { app_id: 730, running: true });

        let plain = AppLifetimeNotification::from_value(&json!({ "app_id": "570", "running": 0 }));
        assert_eq!(plain, AppLifetimeNotification { app_id: 570, running: false });

        let broken = AppLifetimeNotification::from_value(&json!({ "unAppID": {}, "bRunning": "maybe" }));
        assert_eq!(broken, AppLifetimeNotification { app_id: 0, running: false });
    }

    #[test]
    fn test_download_items_coercion() {
        let update = DownloadItemsUpdate::from_value(&json!({
            "isDownloading": true,
            "items": [
                { "appid": 10, "active": true, "completed": false },
                { "appid": "x", "active": "yes" },
                42
            ]
        }));
        assert!(update.is_downloading);
        assert_eq!(update.items.len(), 3);
        assert_eq!(update.items[0].app_id, Some(10));
        assert_eq!(update.items[1].app_id, None);
        assert!(update.items[1].active);
        assert!(!update.items[2].active);

        let empty = DownloadItemsUpdate::from_value(&json!({ "items": "nope" }));
        assert!(!empty.is_downloading);
        assert!(empty.items.is_empty());
    }

    #[test]
    fn test_download_overview_fields() {
        let overview = DownloadOverview::from_value(&json!({
            "update_appid": 10,
            "update_bytes_downloaded": 500,
            "update_bytes_to_download": -3,
            "update_network_bytes_per_second": 125000.0
        }));
        assert_eq!(overview.app_id, Some(10));
        assert_eq!(overview.bytes_downloaded, 500);
        assert_eq!(overview.bytes_to_download, 0);
        assert_eq!(overview.bytes_per_second, Some(125_000));

        let bare = DownloadOverview::from_value(&json!({}));
        assert_eq!(bare.bytes_per_second, None);
        assert_eq!(bare.app_id, None);
    }

    #[test]
    fn test_power_notification() {
        assert_eq!(
            PowerNotification::from_value(&json!({ "state": "Suspend" })),
            Some(PowerNotification::Suspend)
        );
        assert_eq!(
            PowerNotification::from_value(&json!({ "event": "shutting_down" })),
            Some(PowerNotification::Shutdown)
        );
        assert_eq!(PowerNotification::from_value(&json!({ "state": 3 })), None);
    }

    #[test]
    fn test_registry_dispatch_and_cancel() {
        let registry = HandlerRegistry::<u32>::new("numbers");
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let token = registry
            .subscribe(Box::new(move |n| sink.lock().push(n)))
            .unwrap();
        registry.dispatch(7);
        assert_eq!(*seen.lock(), vec![7]);

        token.cancel().unwrap();
        assert_eq!(registry.handler_count(), 0);
        registry.dispatch(8);
        assert_eq!(*seen.lock(), vec![7]);
    }

    #[test]
    fn test_token_unregisters_once_on_drop() {
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        {
            let _token = CancelToken::new("test", move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        let counter = Arc::clone(&calls);
        let token = CancelToken::new("test", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        token.cancel().unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_json_lines_dispatch() {
        let platform = JsonLinesPlatform::new();
        let hooks = platform.hooks();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&seen);
        let _token = hooks
            .app_lifetime
            .subscribe(Box::new(move |n: AppLifetimeNotification| sink.lock().push(n.app_id)))
            .unwrap();

        platform
            .dispatch_line(r#"{"family":"app_lifetime","unAppID":730,"bRunning":true}"#)
            .unwrap();
        platform.dispatch_line("").unwrap();
        platform.dispatch_line(r#"{"family":"unknown"}"#).unwrap();
        assert!(platform.dispatch_line("{not json").is_err());

        assert_eq!(*seen.lock(), vec![730]);
    }

    #[test]
    fn test_run_skips_malformed_lines() {
        let platform = JsonLinesPlatform::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _token = platform
            .hooks()
            .power
            .subscribe(Box::new(move |n| sink.lock().push(n)))
            .unwrap();

        let input = "{\"family\":\"power\",\"state\":\"suspend\"}\ngarbage\n{\"family\":\"power\",\"state\":\"resume\"}\n";
        platform.run(std::io::Cursor::new(input)).unwrap();

        assert_eq!(
            *seen.lock(),
            vec![PowerNotification::Suspend, PowerNotification::Resume]
        );
    }

    #[test]
    fn test_run_survives_invalid_utf8() {
        let platform = JsonLinesPlatform::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _token = platform
            .hooks()
            .power
            .subscribe(Box::new(move |n| sink.lock().push(n)))
            .unwrap();

        let mut input = b"\xff\xfe garbage\n".to_vec();
        input.extend_from_slice(b"{\"family\":\"power\",\"state\":\"shutdown\"}");
        platform.run(std::io::Cursor::new(input)).unwrap();

        assert_eq!(*seen.lock(), vec![PowerNotification::Shutdown]);
    }
}
