//! Connection statistics and their display formatting.

use std::fmt;
use std::time::Duration;

/// Traffic and spending for the active connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionStatistic {
    /// Bytes sent through the tunnel
    pub bytes_sent: u64,
    /// Bytes received through the tunnel
    pub bytes_received: u64,
    /// Tokens paid to the provider so far
    pub tokens_spent: f64,
    /// Time since the connection was established
    pub duration: Duration,
}

impl ConnectionStatistic {
    /// Format as a one-line summary for notifications.
    pub fn format(&self, currency: &str) -> String {
        format!(
            "↓ {} ↑ {} | {} | {}",
            DataSize::from_bytes(self.bytes_received),
            DataSize::from_bytes(self.bytes_sent),
            display_money(self.tokens_spent, currency, 3),
            format_duration(self.duration)
        )
    }
}

/// Byte count scaled to a display unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DataSize {
    pub value: f64,
    pub units: &'static str,
}

impl DataSize {
    pub fn from_bytes(bytes: u64) -> Self {
        const KB: u64 = 1024;
        const MB: u64 = KB * 1024;
        const GB: u64 = MB * 1024;

        let (value, units) = if bytes >= GB {
            (bytes as f64 / GB as f64, "GB")
        } else if bytes >= MB {
            (bytes as f64 / MB as f64, "MB")
        } else if bytes >= KB {
            (bytes as f64 / KB as f64, "KB")
        } else {
            (bytes as f64, "B")
        };
        Self { value, units }
    }
}

impl fmt::Display for DataSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.units == "B" {
            write!(f, "{} {}", self.value, self.units)
        } else {
            write!(f, "{:.2} {}", self.value, self.units)
        }
    }
}

/// Render a token amount, e.g. `0.125 MYSTT`.
pub fn display_money(amount: f64, currency: &str, fraction_digits: usize) -> String {
    format!("{:.*} {}", fraction_digits, amount, currency)
}

/// `HH:MM:SS`
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_data_size_units() {
        assert_eq!(DataSize::from_bytes(512).units, "B");
        assert_eq!(DataSize::from_bytes(2048).units, "KB");
        assert_eq!(DataSize::from_bytes(5 * 1024 * 1024).units, "MB");
        assert_eq!(DataSize::from_bytes(3 * 1024 * 1024 * 1024).units, "GB");
    }

    #[test]
    fn test_data_size_display() {
        assert_eq!(DataSize::from_bytes(512).to_string(), "512 B");
        assert_eq!(DataSize::from_bytes(1536).to_string(), "1.50 KB");
    }

    #[test]
    fn test_display_money() {
        assert_eq!(display_money(0.1254, "MYSTT", 3), "0.125 MYSTT");
        assert_eq!(display_money(2.0, "USD", 2), "2.00 USD");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_secs(3725)), "01:02:05");
    }

    #[test]
    fn test_statistic_format() {
        let stats = ConnectionStatistic {
            bytes_sent: 1024,
            bytes_received: 2 * 1024 * 1024,
            tokens_spent: 0.5,
            duration: Duration::from_secs(61),
        };

        assert_eq!(
            stats.format("MYSTT"),
            "↓ 2.00 MB ↑ 1.00 KB | 0.500 MYSTT | 00:01:01"
        );
    }
}
