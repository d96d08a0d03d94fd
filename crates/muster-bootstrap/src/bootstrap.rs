//! Negotiate, then validate.

use muster_group::{validate, GroupSession, ValidationReport};
use tracing::{info, warn};

use crate::config::BootstrapConfig;
use crate::connector::Connector;
use crate::error::Result;
use crate::negotiator::Negotiator;

/// Form the group and check it with the collective validator.
///
/// On any failure after the group formed, the session is torn down before
/// the error is returned.
pub async fn bootstrap<C: Connector>(config: &BootstrapConfig, connector: C) -> Result<(GroupSession, ValidationReport)> {
    let mut negotiator = Negotiator::new(config, connector);
    let mut session = negotiator.negotiate().await?;

    let checked = match validate(&mut session).await {
        Ok(report) => report.into_result(),
        Err(e) => Err(e),
    };

    match checked {
        Ok(report) => {
            info!(rank = report.rank, world_size = report.world_size, "Group validated");
            Ok((session, report))
        }
        Err(e) => {
            warn!(rank = config.rank(), error = %e, "Validation failed, tearing down");
            if let Err(teardown) = session.teardown().await {
                warn!(error = %teardown, "Teardown after failed validation also failed");
            }
            Err(e.into())
        }
    }
}
