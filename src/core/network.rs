//! Host reachability, reduced to one edge-triggered `online` stream.
//!
//! Each D-Bus service speaks its own dialect; a [`ReachabilitySource`] turns
//! it into [`RawSignal`]s and [`observe`] coalesces those into transitions.

use std::collections::HashMap;

use futures::future;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use zbus::zvariant::{OwnedObjectPath, OwnedValue};

use crate::config::NetworkSource;
use crate::core::error::WatchError;

// NetworkManager NMState values.
const NM_STATE_CONNECTING: u32 = 40;
const NM_STATE_CONNECTED_GLOBAL: u32 = 70;

const NM_DEST: &str = "org.freedesktop.NetworkManager";
const NM_PATH: &str = "/org/freedesktop/NetworkManager";

const WPA_DEST: &str = "fi.w1.wpa_supplicant1";
const WPA_PATH: &str = "/fi/w1/wpa_supplicant1";
const WPA_IFACE: &str = "fi.w1.wpa_supplicant1.Interface";

const CONNMAN_DEST: &str = "net.connman";
const CONNMAN_MANAGER: &str = "net.connman.Manager";

/// One decoded reading from a reachability service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawSignal {
    Online(bool),
    /// A reading that says nothing about global reachability.
    Indeterminate,
    Malformed(String),
}

pub fn nm_state(state: u32) -> RawSignal {
    match state {
        NM_STATE_CONNECTED_GLOBAL => RawSignal::Online(true),
        s if s <= NM_STATE_CONNECTING => RawSignal::Online(false),
        // CONNECTED_LOCAL / CONNECTED_SITE
        _ => RawSignal::Indeterminate,
    }
}

pub fn wpa_state(state: &str) -> RawSignal {
    RawSignal::Online(state == "completed")
}

pub fn connman_state(state: &str) -> RawSignal {
    RawSignal::Online(state == "online")
}

/// A service that reports whether the host is online.
pub trait ReachabilitySource: Send {
    fn name(&self) -> &'static str;

    /// Consume the source. The stream never ends while the service lives.
    fn signals(self: Box<Self>) -> BoxStream<'static, RawSignal>;
}

pub fn source_for(config: &NetworkSource) -> Box<dyn ReachabilitySource> {
    match config {
        NetworkSource::None => Box::new(AlwaysOnline),
        NetworkSource::NetworkManager => Box::new(NetworkManager),
        NetworkSource::WpaSupplicant { interface } => Box::new(WpaSupplicant {
            interface: interface.clone(),
        }),
        NetworkSource::Connman => Box::new(Connman),
    }
}

/// No reachability service configured: online once, forever.
pub struct AlwaysOnline;

impl ReachabilitySource for AlwaysOnline {
    fn name(&self) -> &'static str {
        "none"
    }

    fn signals(self: Box<Self>) -> BoxStream<'static, RawSignal> {
        stream::once(future::ready(RawSignal::Online(true)))
            .chain(stream::pending())
            .boxed()
    }
}

pub struct NetworkManager;

impl ReachabilitySource for NetworkManager {
    fn name(&self) -> &'static str {
        "NetworkManager"
    }

    fn signals(self: Box<Self>) -> BoxStream<'static, RawSignal> {
        subscribed(self.name(), async {
            let conn = zbus::Connection::system().await?;
            let proxy = build_proxy(&conn, NM_DEST, NM_PATH.to_string(), NM_DEST).await?;
            let changes = proxy.receive_signal("StateChanged").await?;
            let initial = match proxy.get_property::<u32>("State").await {
                Ok(state) => nm_state(state),
                Err(e) => RawSignal::Malformed(format!("State property: {e}")),
            };
            let changes = changes.map(|msg| match msg.body().deserialize::<u32>() {
                Ok(state) => nm_state(state),
                Err(e) => RawSignal::Malformed(format!("StateChanged: {e}")),
            });
            Ok(stream::once(future::ready(initial)).chain(changes).boxed())
        })
    }
}

pub struct WpaSupplicant {
    pub interface: String,
}

impl ReachabilitySource for WpaSupplicant {
    fn name(&self) -> &'static str {
        "wpa_supplicant"
    }

    fn signals(self: Box<Self>) -> BoxStream<'static, RawSignal> {
        let interface = self.interface;
        subscribed("wpa_supplicant", async move {
            let conn = zbus::Connection::system().await?;
            let root = build_proxy(&conn, WPA_DEST, WPA_PATH.to_string(), WPA_DEST).await?;
            let path: OwnedObjectPath = root.call("GetInterface", &(interface.as_str(),)).await?;
            log::debug!("wpa_supplicant interface {} is {}", interface, path.as_str());

            let proxy = build_proxy(&conn, WPA_DEST, path.as_str().to_string(), WPA_IFACE).await?;
            let changes = proxy.receive_signal("PropertiesChanged").await?;
            let initial = match proxy.get_property::<String>("State").await {
                Ok(state) => wpa_state(&state),
                Err(e) => RawSignal::Malformed(format!("State property: {e}")),
            };
            let changes = changes.map(|msg| {
                match msg.body().deserialize::<HashMap<String, OwnedValue>>() {
                    Ok(mut props) => match props.remove("State").map(String::try_from) {
                        Some(Ok(state)) => wpa_state(&state),
                        Some(Err(e)) => RawSignal::Malformed(format!("State value: {e}")),
                        None => RawSignal::Indeterminate,
                    },
                    Err(e) => RawSignal::Malformed(format!("PropertiesChanged: {e}")),
                }
            });
            Ok(stream::once(future::ready(initial)).chain(changes).boxed())
        })
    }
}

pub struct Connman;

impl ReachabilitySource for Connman {
    fn name(&self) -> &'static str {
        "ConnMan"
    }

    fn signals(self: Box<Self>) -> BoxStream<'static, RawSignal> {
        subscribed(self.name(), async {
            let conn = zbus::Connection::system().await?;
            let proxy = build_proxy(&conn, CONNMAN_DEST, "/".to_string(), CONNMAN_MANAGER).await?;
            let changes = proxy.receive_signal("PropertyChanged").await?;
            let props: zbus::Result<HashMap<String, OwnedValue>> =
                proxy.call("GetProperties", &()).await;
            let initial = match props {
                Ok(mut props) => connman_property(props.remove("State")),
                Err(e) => RawSignal::Malformed(format!("GetProperties: {e}")),
            };
            let changes = changes.map(|msg| match msg.body().deserialize::<(String, OwnedValue)>() {
                Ok((name, value)) if name == "State" => connman_property(Some(value)),
                Ok(_) => RawSignal::Indeterminate,
                Err(e) => RawSignal::Malformed(format!("PropertyChanged: {e}")),
            });
            Ok(stream::once(future::ready(initial)).chain(changes).boxed())
        })
    }
}

fn connman_property(value: Option<OwnedValue>) -> RawSignal {
    match value.map(String::try_from) {
        Some(Ok(state)) => connman_state(&state),
        Some(Err(e)) => RawSignal::Malformed(format!("State value: {e}")),
        None => RawSignal::Malformed("no State property".to_string()),
    }
}

async fn build_proxy(
    conn: &zbus::Connection,
    destination: &'static str,
    path: String,
    interface: &'static str,
) -> zbus::Result<zbus::Proxy<'static>> {
    zbus::proxy::Builder::<'static, zbus::Proxy<'static>>::new(conn)
        .destination(destination)?
        .path(path)?
        .interface(interface)?
        .cache_properties(zbus::proxy::CacheProperties::No)
        .build()
        .await
}

/// Run `subscribe`; if the service is unreachable, log it and stay silent.
fn subscribed<F>(name: &'static str, subscribe: F) -> BoxStream<'static, RawSignal>
where
    F: future::Future<Output = zbus::Result<BoxStream<'static, RawSignal>>> + Send + 'static,
{
    stream::once(subscribe)
        .flat_map(move |result| match result {
            Ok(signals) => {
                log::info!("Watching {} for reachability", name);
                signals
            }
            Err(e) => {
                log::error!("Cannot subscribe to {}: {}", name, e);
                stream::pending().boxed()
            }
        })
        .boxed()
}

/// Suppresses repeats so only edges get through.
#[derive(Debug, Default)]
pub struct EdgeFilter {
    last: Option<bool>,
}

impl EdgeFilter {
    pub fn accept(&mut self, online: bool) -> Option<bool> {
        if self.last == Some(online) {
            return None;
        }
        self.last = Some(online);
        Some(online)
    }
}

/// Coalesce a source into online/offline transitions.
pub fn observe(source: Box<dyn ReachabilitySource>) -> BoxStream<'static, bool> {
    let name = source.name();
    let mut edges = EdgeFilter::default();
    source
        .signals()
        .filter_map(move |signal| {
            let edge = match signal {
                RawSignal::Online(online) => edges.accept(online),
                RawSignal::Indeterminate => None,
                RawSignal::Malformed(detail) => {
                    log::warn!(
                        "{}",
                        WatchError::MalformedSignal {
                            source_name: name,
                            detail
                        }
                    );
                    None
                }
            };
            if let Some(online) = edge {
                log::info!("{}: {}", name, if online { "online" } else { "offline" });
            }
            future::ready(edge)
        })
        .boxed()
}
