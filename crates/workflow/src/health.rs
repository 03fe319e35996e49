use serde::Serialize;

/// Point-in-time engine health snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    /// At least one workflow is registered and the store answered a ping.
    pub healthy: bool,
    pub store_reachable: bool,
    pub registered_workflows: usize,
    pub workflow_names: Vec<String>,
    /// Executions started within the lookback window that ended, or are
    /// ending, in a failure status.
    pub recent_failures: usize,
}

impl HealthReport {
    pub fn status_label(&self) -> &'static str {
        if self.healthy { "healthy" } else { "unhealthy" }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_for_http() {
        let report = HealthReport {
            healthy: false,
            store_reachable: true,
            registered_workflows: 0,
            workflow_names: vec![],
            recent_failures: 2,
        };

        assert_eq!(report.status_label(), "unhealthy");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["healthy"], false);
        assert_eq!(json["recent_failures"], 2);
    }
}
