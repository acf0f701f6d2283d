//! IMU, magnetometer and barometer telemetry

use std::fmt::Write as _;

/// Column header of the companion telemetry CSV
pub const TELEMETRY_CSV_HEADER: &str = "timestamp,rotation_x,rotation_y,rotation_z,\
accel_x,accel_y,accel_z,gyro_x,gyro_y,gyro_z,mag_x,mag_y,mag_z,pressure,temperature";

/// One sensor reading keyed by capture timestamp
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TelemetrySample {
    /// Capture timestamp (milliseconds since the Unix epoch)
    pub timestamp_ms: u64,
    /// Orientation as Euler angles (degrees)
    pub rotation: [f32; 3],
    /// Linear acceleration (m/s²)
    pub accel: [f32; 3],
    /// Angular velocity (deg/s)
    pub gyro: [f32; 3],
    /// Calibrated magnetic field (µT)
    pub mag: [f32; 3],
    /// Barometric pressure (hPa)
    pub pressure: f32,
    /// IMU temperature (Celsius)
    pub temperature: f32,
}

impl TelemetrySample {
    /// Format as one CSV row (no trailing newline), columns as in the header
    pub fn to_csv_row(&self) -> String {
        let mut row = String::with_capacity(160);
        let _ = write!(row, "{}", self.timestamp_ms);
        for v in self
            .rotation
            .iter()
            .chain(&self.accel)
            .chain(&self.gyro)
            .chain(&self.mag)
        {
            let _ = write!(row, ",{}", v);
        }
        let _ = write!(row, ",{},{}", self.pressure, self.temperature);
        row
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_matches_header_columns() {
        let sample = TelemetrySample {
            timestamp_ms: 1_700_000_000_123,
            rotation: [1.5, -2.0, 3.25],
            accel: [0.0, 0.0, 9.81],
            pressure: 1013.25,
            temperature: 21.5,
            ..Default::default()
        };
        let row = sample.to_csv_row();
        assert_eq!(
            row.split(',').count(),
            TELEMETRY_CSV_HEADER.split(',').count()
        );
        assert!(row.starts_with("1700000000123,1.5,-2,3.25,0,0,9.81"));
        assert!(row.ends_with(",1013.25,21.5"));
    }
}
