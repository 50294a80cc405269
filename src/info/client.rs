use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::json;

use super::{NetworkPlayerInfo, METHOD_LIST_PLAYERS, METHOD_LIST_SERVERS, METHOD_WHO_AM_I, SERVICE};
use crate::rpc::{RpcClient, RpcError};

type NameFuture = Shared<BoxFuture<'static, Result<String, RpcError>>>;

#[derive(Default)]
struct NameSlot {
    cached: Option<String>,
    in_flight: Option<NameFuture>,
}

/// Backend-side consumer of the network info service.
///
/// The own-name lookup is cached permanently after the first success, and
/// concurrent lookups share one in-flight request instead of each issuing
/// their own. A failed lookup clears the slot so the next caller retries.
pub struct NetworkInfoClient {
    rpc: Arc<RpcClient>,
    name_slot: Arc<Mutex<NameSlot>>,
}

impl NetworkInfoClient {
    pub fn new(rpc: Arc<RpcClient>) -> Self {
        Self {
            rpc,
            name_slot: Arc::new(Mutex::new(NameSlot::default())),
        }
    }

    /// The network-visible name of this server, as the proxy knows it.
    pub async fn network_server_name(&self) -> Result<String, RpcError> {
        let flight = {
            let mut slot = self.name_slot.lock().expect("name slot poisoned");
            if let Some(name) = &slot.cached {
                return Ok(name.clone());
            }
            match &slot.in_flight {
                Some(flight) => flight.clone(),
                None => {
                    let rpc = self.rpc.clone();
                    let flight: NameFuture = async move {
                        let name: String = rpc.call_proxy(SERVICE, METHOD_WHO_AM_I, &json!({})).await?;
                        if name.trim().is_empty() {
                            return Err(RpcError::NoResult);
                        }
                        Ok(name)
                    }
                    .boxed()
                    .shared();
                    slot.in_flight = Some(flight.clone());
                    flight
                }
            }
        };

        let result = flight.clone().await;

        let mut slot = self.name_slot.lock().expect("name slot poisoned");
        if slot.in_flight.as_ref().is_some_and(|f| f.ptr_eq(&flight)) {
            slot.in_flight = None;
            if let Ok(name) = &result {
                slot.cached = Some(name.clone());
            }
        }
        result
    }

    /// Names of all servers registered with the proxy.
    pub async fn servers(&self) -> Result<Vec<String>, RpcError> {
        self.rpc.call_proxy(SERVICE, METHOD_LIST_SERVERS, &json!({})).await
    }

    /// Everyone currently connected anywhere on the network.
    pub async fn players(&self) -> Result<Vec<NetworkPlayerInfo>, RpcError> {
        self.rpc.call_proxy(SERVICE, METHOD_LIST_PLAYERS, &json!({})).await
    }

    pub fn close(&self) {
        self.rpc.close();
    }
}
