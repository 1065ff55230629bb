use serde::{Deserialize, Serialize, Serializer};

/// One classification result for a single sampled frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Observation {
    Open,
    Closed,
    Yawn,
    Unknown,
}

impl Observation {
    /// Parses a classifier label. Only the four exact labels are accepted,
    /// ignoring surrounding whitespace and case.
    pub fn parse_label(text: &str) -> Option<Self> {
        match text.trim().to_ascii_uppercase().as_str() {
            "OPEN" => Some(Observation::Open),
            "CLOSED" => Some(Observation::Closed),
            "YAWN" => Some(Observation::Yawn),
            "UNKNOWN" => Some(Observation::Unknown),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Observation::Open => "OPEN",
            Observation::Closed => "CLOSED",
            Observation::Yawn => "YAWN",
            Observation::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for Observation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the session currently shows: a settled label, or `Analyzing` while
/// a classification call is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObservationState {
    Analyzing,
    Observed(Observation),
}

impl Default for ObservationState {
    fn default() -> Self {
        ObservationState::Observed(Observation::Unknown)
    }
}

impl Serialize for ObservationState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl std::fmt::Display for ObservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObservationState::Analyzing => f.write_str("ANALYZING"),
            ObservationState::Observed(obs) => obs.fmt(f),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SystemState {
    Idle,
    Observing,
    Alarmed,
}

impl SystemState {
    pub fn derive(active: bool, alarm: bool) -> Self {
        match (active, alarm) {
            (_, true) => SystemState::Alarmed,
            (true, false) => SystemState::Observing,
            (false, false) => SystemState::Idle,
        }
    }
}

/// Side effect requested from the alert sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    None,
    BeginAlert,
    EndAlert,
}

/// Run-scoped state for one start/stop lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Session {
    pub drowsy_count: u32,
    pub alarm: bool,
    pub observation: ObservationState,
}

impl Session {
    /// Fresh run: counter zeroed, alarm cleared, observation unknown.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// End of a run. The alarm is left for an explicit reset.
    pub fn end_run(&mut self) {
        self.drowsy_count = 0;
        self.observation = ObservationState::default();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct CycleMetrics {
    pub total_cycles: u64,
    pub skipped_cycles: u64,
    /// Cycles whose classifier latency exceeded the analysis interval.
    pub slow_cycles: u64,
    pub worst_case_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusSnapshot {
    pub state: SystemState,
    pub active: bool,
    pub observation: ObservationState,
    pub drowsy_count: u32,
    pub alarm: bool,
    pub error: Option<String>,
    pub metrics: CycleMetrics,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            state: SystemState::Idle,
            active: false,
            observation: ObservationState::default(),
            drowsy_count: 0,
            alarm: false,
            error: None,
            metrics: CycleMetrics::default(),
        }
    }
}
