/// Scan duty-cycle state machine
///
/// Alternates between a scanning phase and an idle interval until a device
/// advertising the target service shows up or the scan is stopped. The
/// machine never touches the radio or a clock itself: every input returns the
/// list of [`ScanAction`]s the owner must carry out.

use super::transport::ScanReport;
use crate::config::{ConfigError, ScanConfig};
use crate::gatt::ServiceId;
use std::time::Duration;
use tracing::debug;

/// Scanner state; the target service rides along while working
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    /// Not scanning
    Idle,
    /// Radio scanning for the target
    Scanning { service_id: ServiceId },
    /// Paused between scanning phases
    IntervalWait { service_id: ServiceId },
}

/// Identifies one armed timer; fires carrying a stale token are ignored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerToken(u64);

/// Side effects requested by the scanner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanAction {
    StartScan,
    StopScan,
    ArmTimer { token: TimerToken, after: Duration },
    CancelTimer(TimerToken),
    Found(ScanReport),
    Failed(i32),
}

pub struct Scanner {
    state: ScanState,
    config: ScanConfig,
    active_timer: Option<TimerToken>,
    next_token: u64,
}

impl Scanner {
    pub fn new(config: ScanConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            state: ScanState::Idle,
            config,
            active_timer: None,
            next_token: 0,
        })
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// True while scanning or waiting out an interval
    pub fn is_working(&self) -> bool {
        self.state != ScanState::Idle
    }

    pub fn target(&self) -> Option<ServiceId> {
        match self.state {
            ScanState::Idle => None,
            ScanState::Scanning { service_id } | ScanState::IntervalWait { service_id } => {
                Some(service_id)
            }
        }
    }

    /// Start (or restart) scanning for `service_id`
    pub fn start(&mut self, service_id: ServiceId) -> Vec<ScanAction> {
        let mut actions = self.cancel_timer();
        if matches!(self.state, ScanState::Scanning { .. }) {
            actions.push(ScanAction::StopScan);
        }
        debug!("Scan start for {}", service_id);
        actions.push(ScanAction::StartScan);
        self.state = ScanState::Scanning { service_id };
        actions.push(self.arm(self.config.scan_timeout()));
        actions
    }

    /// Cancel any pending timer and return to `Idle`; idempotent
    pub fn stop(&mut self) -> Vec<ScanAction> {
        let mut actions = self.cancel_timer();
        if matches!(self.state, ScanState::Scanning { .. }) {
            actions.push(ScanAction::StopScan);
        }
        if self.state != ScanState::Idle {
            debug!("Scan stopped");
        }
        self.state = ScanState::Idle;
        actions
    }

    /// A previously armed timer elapsed
    pub fn on_timer(&mut self, token: TimerToken) -> Vec<ScanAction> {
        if self.active_timer != Some(token) {
            debug!("Ignoring stale scan timer {:?}", token);
            return Vec::new();
        }
        self.active_timer = None;

        match self.state {
            ScanState::Scanning { service_id } => {
                debug!("Scan interval");
                self.state = ScanState::IntervalWait { service_id };
                vec![
                    ScanAction::StopScan,
                    self.arm(self.config.scan_interval()),
                ]
            }
            ScanState::IntervalWait { service_id } => {
                debug!("Scan again");
                self.state = ScanState::Scanning { service_id };
                vec![
                    ScanAction::StartScan,
                    self.arm(self.config.scan_timeout()),
                ]
            }
            ScanState::Idle => Vec::new(),
        }
    }

    /// An advertisement arrived from the radio
    pub fn on_scan_result(&mut self, report: ScanReport) -> Vec<ScanAction> {
        let ScanState::Scanning { service_id } = self.state else {
            return Vec::new();
        };
        if !report.advertises(&service_id) {
            return Vec::new();
        }
        debug!("Found {} advertising {}", report.device, service_id);
        let mut actions = self.stop();
        actions.push(ScanAction::Found(report));
        actions
    }

    /// The platform reported a scan failure
    pub fn on_scan_failed(&mut self, code: i32) -> Vec<ScanAction> {
        if self.state == ScanState::Idle {
            debug!("Ignoring scan failure {} while idle", code);
            return Vec::new();
        }
        let mut actions = self.cancel_timer();
        self.state = ScanState::Idle;
        actions.push(ScanAction::Failed(code));
        actions
    }

    fn arm(&mut self, after: Duration) -> ScanAction {
        self.next_token += 1;
        let token = TimerToken(self.next_token);
        self.active_timer = Some(token);
        ScanAction::ArmTimer { token, after }
    }

    fn cancel_timer(&mut self) -> Vec<ScanAction> {
        self.active_timer
            .take()
            .map(ScanAction::CancelTimer)
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::{uuid_from_short, DeviceId};

    fn scanner() -> Scanner {
        Scanner::new(ScanConfig::default()).expect("Scanner creation")
    }

    fn armed_token(actions: &[ScanAction]) -> TimerToken {
        actions
            .iter()
            .find_map(|a| match a {
                ScanAction::ArmTimer { token, .. } => Some(*token),
                _ => None,
            })
            .expect("timer armed")
    }

    #[test]
    fn test_scanner_creation() {
        let scanner = scanner();
        assert_eq!(scanner.state(), ScanState::Idle);
        assert!(!scanner.is_working());
        assert_eq!(scanner.target(), None);
    }

    #[test]
    fn test_scanner_invalid_config() {
        let config = ScanConfig {
            scan_timeout_ms: 0,
            scan_interval_ms: 1000,
        };
        assert!(Scanner::new(config).is_err());
    }

    #[test]
    fn test_start_scans_and_arms_timeout() {
        let mut scanner = scanner();
        let service = uuid_from_short(0xFFF0);
        let actions = scanner.start(service);

        assert_eq!(actions[0], ScanAction::StartScan);
        assert!(matches!(
            actions[1],
            ScanAction::ArmTimer { after, .. } if after == Duration::from_millis(1000)
        ));
        assert_eq!(scanner.state(), ScanState::Scanning { service_id: service });
        assert!(scanner.is_working());
    }

    #[test]
    fn test_duty_cycle_alternates() {
        let mut scanner = scanner();
        let service = uuid_from_short(0xFFF0);
        let mut token = armed_token(&scanner.start(service));

        for _ in 0..3 {
            let actions = scanner.on_timer(token);
            assert_eq!(actions[0], ScanAction::StopScan);
            assert_eq!(scanner.state(), ScanState::IntervalWait { service_id: service });
            token = armed_token(&actions);

            let actions = scanner.on_timer(token);
            assert_eq!(actions[0], ScanAction::StartScan);
            assert_eq!(scanner.state(), ScanState::Scanning { service_id: service });
            token = armed_token(&actions);
        }
    }

    #[test]
    fn test_restart_cancels_active_timer() {
        let mut scanner = scanner();
        let first = armed_token(&scanner.start(uuid_from_short(0xFFF0)));
        let actions = scanner.start(uuid_from_short(0xFFF1));

        assert_eq!(actions[0], ScanAction::CancelTimer(first));
        assert_eq!(actions[1], ScanAction::StopScan);
        assert_eq!(actions[2], ScanAction::StartScan);
        assert_eq!(scanner.target(), Some(uuid_from_short(0xFFF1)));

        // the old timer no longer drives the machine
        assert!(scanner.on_timer(first).is_empty());
        assert!(matches!(scanner.state(), ScanState::Scanning { .. }));
    }

    #[test]
    fn test_found_stops_and_reports_once() {
        let mut scanner = scanner();
        let service = uuid_from_short(0xFFF0);
        let token = armed_token(&scanner.start(service));

        let other = ScanReport::new(DeviceId::from("other"), vec![uuid_from_short(0x180D)]);
        assert!(scanner.on_scan_result(other).is_empty());

        let report = ScanReport::new(DeviceId::from("target"), vec![service]);
        let actions = scanner.on_scan_result(report.clone());
        assert_eq!(
            actions,
            vec![
                ScanAction::CancelTimer(token),
                ScanAction::StopScan,
                ScanAction::Found(report.clone()),
            ]
        );
        assert_eq!(scanner.state(), ScanState::Idle);

        // late duplicate is ignored
        assert!(scanner.on_scan_result(report).is_empty());
    }

    #[test]
    fn test_results_ignored_during_interval() {
        let mut scanner = scanner();
        let service = uuid_from_short(0xFFF0);
        let token = armed_token(&scanner.start(service));
        scanner.on_timer(token);

        let report = ScanReport::new(DeviceId::from("target"), vec![service]);
        assert!(scanner.on_scan_result(report).is_empty());
        assert!(matches!(scanner.state(), ScanState::IntervalWait { .. }));
    }

    #[test]
    fn test_scan_failure_resets() {
        let mut scanner = scanner();
        let token = armed_token(&scanner.start(uuid_from_short(0xFFF0)));
        let actions = scanner.on_scan_failed(2);

        assert_eq!(
            actions,
            vec![ScanAction::CancelTimer(token), ScanAction::Failed(2)]
        );
        assert!(!scanner.is_working());
        assert!(scanner.on_scan_failed(2).is_empty());
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut scanner = scanner();
        let token = armed_token(&scanner.start(uuid_from_short(0xFFF0)));
        let interval = armed_token(&scanner.on_timer(token));

        assert_eq!(scanner.stop(), vec![ScanAction::CancelTimer(interval)]);
        assert!(scanner.stop().is_empty());
        assert_eq!(scanner.state(), ScanState::Idle);
        assert!(scanner.on_timer(interval).is_empty());
    }
}
