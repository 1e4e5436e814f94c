use std::fmt;

/// Settings key selecting the scan policy: 0 scans in-process, any other
/// value scans in a worker process.
pub const SCAN_MODE_KEY: &str = "pluginScanMode";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScanPolicy {
    #[default]
    InProcess,
    OutOfProcess,
}

impl ScanPolicy {
    pub fn from_setting(value: i64) -> Self {
        if value == 0 {
            Self::InProcess
        } else {
            Self::OutOfProcess
        }
    }

    pub fn as_setting(self) -> i64 {
        match self {
            Self::InProcess => 0,
            Self::OutOfProcess => 1,
        }
    }

    pub fn is_in_process(self) -> bool {
        matches!(self, Self::InProcess)
    }
}

impl fmt::Display for ScanPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::InProcess => "in-process",
            Self::OutOfProcess => "out-of-process",
        })
    }
}
