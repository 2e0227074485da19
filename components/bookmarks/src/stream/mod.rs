/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at http://mozilla.org/MPL/2.0/. */

//! The inbound event stream client: keeps exactly one long-lived channel
//! open per active namespace, reconnecting with exponential backoff and
//! resetting the backoff once a connection has stayed up long enough to
//! count as stable.

pub(crate) mod backoff;
pub(crate) mod event;

pub use self::event::ServerEvent;

use self::backoff::Backoff;
use crate::kernel::KernelShared;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// Connection state of the inbound stream.
///
/// ```text
/// Disconnected -> Connecting -> Connected{stable: false} -> Connected{stable: true}
///        ^                                   |
///        +------- Reconnecting(backoff) <----+ (error/close)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum SseState {
    Disconnected,
    Connecting,
    Connected { stable: bool },
    Reconnecting { attempt: u32 },
}

impl SseState {
    pub fn is_connected(&self) -> bool {
        matches!(self, SseState::Connected { .. })
    }
}

/// Drives the stream for the kernel's active namespace until told to shut
/// down. Spawned once per namespace session; a namespace switch tears it
/// down and spawns a fresh one.
pub(crate) async fn run(shared: Arc<KernelShared>, mut shutdown: watch::Receiver<bool>) {
    let reconnect = shared.config.reconnect.clone();
    let mut backoff = Backoff::new(&reconnect);
    // Whether we have ever had a session on this driver; a stable
    // connection after a drop triggers rehydration to catch up on
    // whatever the stream missed.
    let mut had_session = false;

    'driver: loop {
        if *shutdown.borrow() {
            break;
        }
        let namespace = shared.namespace();
        shared.set_sse_state(SseState::Connecting);
        let opened = tokio::select! {
            r = shared.backend.open_stream(&namespace) => r,
            _ = shutdown.changed() => break 'driver,
        };
        match opened {
            Ok(mut events) => {
                log::info!("event stream open for {:?}", namespace);
                shared.set_sse_state(SseState::Connected { stable: false });
                let resumed = had_session;
                had_session = true;
                let mut stable = false;
                let stable_timer = tokio::time::sleep(reconnect.stable_threshold());
                tokio::pin!(stable_timer);

                loop {
                    tokio::select! {
                        _ = &mut stable_timer, if !stable => {
                            stable = true;
                            backoff.reset();
                            shared.set_sse_state(SseState::Connected { stable: true });
                            if resumed {
                                // We may have missed events while down;
                                // re-baseline the root.
                                let shared = Arc::clone(&shared);
                                tokio::spawn(async move {
                                    if let Err(e) = crate::kernel::rehydrate_root(&shared).await {
                                        log::warn!("rehydration after reconnect failed: {}", e);
                                    }
                                });
                            }
                        }
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break 'driver;
                            }
                        }
                        next = events.next() => match next {
                            Some(Ok(event)) => shared.handle_stream_event(event),
                            Some(Err(e)) => {
                                log::warn!("event stream error: {}", e);
                                break;
                            }
                            None => {
                                log::info!("event stream closed by the service");
                                break;
                            }
                        }
                    }
                }
                // We were connected, so this transition is the
                // user-visible disconnect.
                shared.set_sse_state(SseState::Reconnecting {
                    attempt: backoff.attempt(),
                });
            }
            Err(e) => {
                log::warn!("event stream connect failed: {}", e);
                shared.set_sse_state(SseState::Reconnecting {
                    attempt: backoff.attempt(),
                });
            }
        }
        let delay = backoff.next_delay();
        log::debug!("reconnecting event stream in {:?}", delay);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break 'driver;
                }
            }
        }
    }
    shared.set_sse_state(SseState::Disconnected);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_serialization() {
        let s = SseState::Connected { stable: false };
        let value = serde_json::to_value(s).unwrap();
        assert_eq!(value["phase"], "connected");
        assert_eq!(value["stable"], false);
        assert!(s.is_connected());
        assert!(!SseState::Reconnecting { attempt: 3 }.is_connected());
    }
}
