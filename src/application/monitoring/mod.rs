// Model health, market risk and alert routing
pub mod alert_manager;
pub mod model_monitor;
pub mod risk_monitor;
pub mod state_tracker;

pub use alert_manager::{AlertManager, AlertSummary, LogAlertHandler};
pub use model_monitor::{HealthIssue, HealthStatus, ModelMonitor, MonitorThresholds, MonitoringUpdate};
pub use risk_monitor::{RiskMonitor, RiskThresholds};
pub use state_tracker::{MarketState, MarketStateTracker};
