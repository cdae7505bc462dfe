use time::OffsetDateTime;

/// Number of data bytes in a frame, excluding the line terminator
pub const DATA_LEN: usize = 16;

/// Nominal frame length on the wire: 16 data bytes + `\n`
pub const FRAME_LEN: usize = DATA_LEN + 1;

/// Number of measurement channels carried by one frame
pub const CHANNEL_COUNT: usize = 8;

/// One newline-terminated line as read from the serial device
pub type RawFrame = Vec<u8>;

/// The 16 data bytes of a frame after hex round-trip decoding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedFrame(pub [u8; DATA_LEN]);

impl DecodedFrame {
    pub fn get(&self, index: usize) -> Option<u8> {
        self.0.get(index).copied()
    }
}

/// A measurement definition: which two bytes form the reading and how to scale it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Channel {
    pub name: &'static str,
    pub low: usize,
    pub high: usize,
    pub scale: f64,
    /// Outbound message field name
    pub field: &'static str,
    /// Column label (with units) in the durable log header
    pub log_label: &'static str,
}

/// Channel table of the MKR sensor board. Order and byte positions are a device contract.
pub const CHANNELS: [Channel; CHANNEL_COUNT] = [
    Channel {
        name: "unnamed gas sensor",
        low: 0,
        high: 1,
        scale: 100.0,
        field: "gas_ppm",
        log_label: "Gas Sensor (PPM)",
    },
    Channel {
        name: "formaldehyde sensor",
        low: 2,
        high: 3,
        scale: 100.0,
        field: "hcho_ppm",
        log_label: "HCHO Sensor (PPM)",
    },
    Channel {
        name: "electrochemical VOC sensor",
        low: 4,
        high: 5,
        scale: 1.0,
        field: "voc_ppm",
        log_label: "EC Sense (PPB)",
    },
    Channel {
        name: "particulate matter 1.0",
        low: 6,
        high: 7,
        scale: 100.0,
        field: "pm1.0_μg/m3",
        log_label: "PM 1.0 (ug/m3)",
    },
    Channel {
        name: "particulate matter 2.5",
        low: 8,
        high: 9,
        scale: 100.0,
        field: "pm2.5_μg/m3",
        log_label: "PM 2.5 (ug/m3)",
    },
    Channel {
        name: "particulate matter 4.0",
        low: 10,
        high: 11,
        scale: 100.0,
        field: "pm4.0_μg/m3",
        log_label: "PM 4.0 (ug/m3)",
    },
    Channel {
        name: "particulate matter 10.0",
        low: 12,
        high: 13,
        scale: 100.0,
        field: "pm10.0_μg/m3",
        log_label: "PM 10.0 (ug/m3)",
    },
    Channel {
        name: "VOC index",
        low: 14,
        high: 15,
        scale: 100.0,
        field: "voc_index",
        log_label: "VOC Index (0-500)",
    },
];

/// Calibrated readings of one pipeline iteration
///
/// `readings` is `None` when the read or decode stage failed; such a set is
/// still recorded but never published.
#[derive(Debug, Clone, PartialEq)]
pub struct MeasurementSet {
    pub captured_at: OffsetDateTime,
    readings: Option<[f64; CHANNEL_COUNT]>,
}

impl MeasurementSet {
    pub fn valid(readings: [f64; CHANNEL_COUNT], captured_at: OffsetDateTime) -> Self {
        Self {
            captured_at,
            readings: Some(readings),
        }
    }

    pub fn invalid(captured_at: OffsetDateTime) -> Self {
        Self {
            captured_at,
            readings: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.readings.is_some()
    }

    pub fn readings(&self) -> Option<&[f64; CHANNEL_COUNT]> {
        self.readings.as_ref()
    }

    /// Reading of the channel at `index` in [`CHANNELS`] order
    pub fn reading(&self, index: usize) -> Option<f64> {
        self.readings.and_then(|r| r.get(index).copied())
    }
}

/// A logical sensor on the board, shaping one outbound message
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PublishGroup {
    pub name: &'static str,
    /// `_meta.sensor` tag of the message
    pub sensor: &'static str,
    /// Indices into [`CHANNELS`]
    pub channels: &'static [usize],
}

pub const GROUP_COUNT: usize = 4;

pub const PUBLISH_GROUPS: [PublishGroup; GROUP_COUNT] = [
    PublishGroup {
        name: "gas",
        sensor: "gas_sensor",
        channels: &[0],
    },
    PublishGroup {
        name: "formaldehyde",
        sensor: "grove_hcho",
        channels: &[1],
    },
    PublishGroup {
        name: "electrochemical",
        sensor: "ec_sense",
        channels: &[2],
    },
    PublishGroup {
        name: "particulate",
        sensor: "SEN54",
        channels: &[3, 4, 5, 6, 7],
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_cover_every_data_byte_once() {
        let mut seen = [0u8; DATA_LEN];
        for channel in CHANNELS.iter() {
            seen[channel.low] += 1;
            seen[channel.high] += 1;
        }
        assert_eq!(CHANNELS.len(), 8);
        assert!(seen.iter().all(|&count| count == 1), "coverage: {:?}", seen);
    }

    #[test]
    fn channels_are_little_endian_pairs_in_order() {
        for (i, channel) in CHANNELS.iter().enumerate() {
            assert_eq!(channel.low, 2 * i);
            assert_eq!(channel.high, 2 * i + 1);
        }
    }

    #[test]
    fn only_electrochemical_channel_is_unscaled() {
        let unscaled: Vec<_> = CHANNELS
            .iter()
            .filter(|c| c.scale == 1.0)
            .map(|c| c.name)
            .collect();
        assert_eq!(unscaled, vec!["electrochemical VOC sensor"]);
        assert!(CHANNELS
            .iter()
            .all(|c| c.scale == 1.0 || c.scale == 100.0));
    }

    #[test]
    fn publish_groups_partition_channel_table() {
        let mut indices: Vec<usize> = PUBLISH_GROUPS
            .iter()
            .flat_map(|g| g.channels.iter().copied())
            .collect();
        indices.sort_unstable();
        assert_eq!(indices, (0..CHANNEL_COUNT).collect::<Vec<_>>());
    }

    #[test]
    fn invalid_set_has_no_readings() {
        let set = MeasurementSet::invalid(OffsetDateTime::UNIX_EPOCH);
        assert!(!set.is_valid());
        assert_eq!(set.readings(), None);
        assert_eq!(set.reading(0), None);
    }

    #[test]
    fn valid_set_exposes_readings_by_index() {
        let readings = [0.5, 3.56, 10.0, 10.0, 0.0, 0.0, 0.0, 2.55];
        let set = MeasurementSet::valid(readings, OffsetDateTime::UNIX_EPOCH);
        assert!(set.is_valid());
        assert_eq!(set.reading(1), Some(3.56));
        assert_eq!(set.reading(8), None);
    }
}
