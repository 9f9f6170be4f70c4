//! Perpetual connector: the spot connector plus positions and funding.

use std::ops::Deref;
use std::sync::Arc;

use lighter_auth::SigningBackend;
use lighter_core::{FundingPayment, MarketId, Position};
use lighter_rest::HttpTransport;

use crate::config::ConnectorConfig;
use crate::error::ConnectorResult;
use crate::spot::SpotConnector;

pub struct PerpetualConnector {
    inner: SpotConnector,
}

impl PerpetualConnector {
    pub fn connect(mut config: ConnectorConfig) -> ConnectorResult<Self> {
        config.derivative = true;
        Ok(Self {
            inner: SpotConnector::connect(config)?,
        })
    }

    pub fn with_parts(
        mut config: ConnectorConfig,
        transport: Arc<dyn HttpTransport>,
        backend: Arc<dyn SigningBackend>,
    ) -> ConnectorResult<Self> {
        config.derivative = true;
        Ok(Self {
            inner: SpotConnector::with_parts(config, transport, backend)?,
        })
    }

    pub fn spot(&self) -> &SpotConnector {
        &self.inner
    }

    /// Open positions as last reported by the position channel or the
    /// reconnect snapshot.
    pub fn positions(&self) -> Vec<Position> {
        self.inner.user_stream().positions()
    }

    pub fn position(&self, market: MarketId) -> Option<Position> {
        self.inner.user_stream().position(market)
    }

    pub fn last_funding_payment(&self, market: MarketId) -> Option<FundingPayment> {
        self.inner.user_stream().last_funding_payment(market)
    }
}

impl Deref for PerpetualConnector {
    type Target = SpotConnector;

    fn deref(&self) -> &SpotConnector {
        &self.inner
    }
}
