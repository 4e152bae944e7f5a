//! Client identification phase.

use serde::Deserialize;
use serde_json::Value;

use super::PhaseContext;
use crate::network::ClientLookupQuery;

/// Who the lookup service thinks the client is.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientIdentity {
    /// Human readable identifier, usually "IP - ISP, country"
    pub processed: String,
    pub raw_isp_info: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupResponse {
    processed_string: String,
    #[serde(default)]
    raw_isp_info: Option<Value>,
}

impl ClientIdentity {
    /// Parses a lookup response; a body that is not the JSON envelope is
    /// used verbatim as the identifier.
    pub fn parse(body: &str) -> Self {
        match serde_json::from_str::<LookupResponse>(body) {
            Ok(response) => Self {
                processed: response.processed_string,
                raw_isp_info: response.raw_isp_info.filter(|info| !info.is_null()),
            },
            Err(_) => Self {
                processed: body.trim().to_string(),
                raw_isp_info: None,
            },
        }
    }
}

/// Runs the client lookup and records the result in the session.
#[derive(Debug)]
pub struct ClientLookup {
    ctx: PhaseContext,
}

impl ClientLookup {
    pub fn new(ctx: PhaseContext) -> Self {
        Self { ctx }
    }

    /// Looks the client up. Failures are logged and yield `None`.
    pub async fn run(self) -> Option<ClientIdentity> {
        let settings = &self.ctx.settings;
        let query = ClientLookupQuery {
            isp: settings.client_lookup_isp_info,
            distance: settings.client_lookup_distance,
        };
        self.ctx.session.record("client lookup started");

        match self
            .ctx
            .transport
            .lookup_client(&settings.endpoints.client_lookup, &query)
            .await
        {
            Ok(body) => {
                let identity = ClientIdentity::parse(&body);
                let published = identity.clone();
                self.ctx.publish(move |s| {
                    s.client_ip = published.processed;
                    s.isp_info = published.raw_isp_info;
                });
                self.ctx
                    .session
                    .record(&format!("client lookup finished: {}", identity.processed));
                Some(identity)
            }
            Err(error) => {
                self.ctx
                    .session
                    .warn(&format!("client lookup failed: {error}"));
                None
            }
        }
    }
}
