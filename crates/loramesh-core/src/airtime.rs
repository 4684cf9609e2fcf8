//! LoRa time-on-air model.
//!
//! The airtime collaborator converts a payload size and radio parameters into
//! the duration a transmission occupies the channel. The scheduler uses it
//! both to space transmissions and to derive duty-cycle silence periods.

/// Computes transmission airtime for the scheduler.
pub trait AirtimeModel {
    /// Airtime in seconds for `payload_bytes` at the given radio settings.
    fn airtime(&self, payload_bytes: usize, sf: u8, bandwidth_hz: f64, coding_rate: u8) -> f64;
}

/// Standard LoRa airtime: explicit header, CRC on, 8-symbol preamble.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoraAirtime;

const PREAMBLE_SYMBOLS: f64 = 8.0;

impl AirtimeModel for LoraAirtime {
    fn airtime(&self, payload_bytes: usize, sf: u8, bandwidth_hz: f64, coding_rate: u8) -> f64 {
        let sf = f64::from(sf);
        // Symbol duration in ms for bandwidth expressed in kHz.
        let t_sym = 2f64.powf(sf) / (bandwidth_hz / 1000.0);
        let t_preamble = (PREAMBLE_SYMBOLS + 4.25) * t_sym / 1000.0;

        let payload = (payload_bytes + 8) as f64;
        let numerator = 8.0 * payload - 4.0 * sf + 28.0 + 16.0;
        let n_payload = 8.0
            + ((numerator / (4.0 * sf)).ceil() * (f64::from(coding_rate) + 4.0)).max(0.0);

        let t_header = 0.5 * (8.0 + n_payload) * t_sym / 1000.0;
        let t_payload = t_header;

        t_preamble + t_header + t_payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sf7_20_bytes() {
        // SF7, 125 kHz, CR 4/5: t_sym = 1.024 ms, 53 payload symbols.
        let t = LoraAirtime.airtime(20, 7, 125_000.0, 1);
        assert!((t - 0.075008).abs() < 1e-9, "got {t}");
    }

    #[test]
    fn test_airtime_grows_with_sf() {
        let a = LoraAirtime.airtime(20, 7, 125_000.0, 1);
        let b = LoraAirtime.airtime(20, 9, 125_000.0, 1);
        let c = LoraAirtime.airtime(20, 12, 125_000.0, 1);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_airtime_grows_with_payload() {
        let small = LoraAirtime.airtime(10, 7, 125_000.0, 1);
        let large = LoraAirtime.airtime(200, 7, 125_000.0, 1);
        assert!(small < large);
    }
}
