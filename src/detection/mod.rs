//! Rule-based checks run over finished flow records.

pub mod ntp;

pub use ntp::{detect_ntp_amplification, NtpAmplification, AMPLIFICATION_THRESHOLD, NTP_PORT};
