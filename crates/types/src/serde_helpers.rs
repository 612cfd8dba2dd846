/// Serialize a tick count (simulated microseconds) as fractional
/// milliseconds, the unit the output records use.
pub mod ticks_ms {
    use crate::Ticks;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(val: &Ticks, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_f64(*val as f64 / 1_000.0)
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Ticks, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms: f64 = Deserialize::deserialize(d)?;
        Ok((ms * 1_000.0).round() as Ticks)
    }
}

#[cfg(test)]
mod tests {
    use crate::Ticks;
    use serde::{Deserialize, Serialize};

    // Small wrapper so we can test #[serde(with = "...")] easily.
    #[derive(Serialize, Deserialize, Debug, PartialEq)]
    struct TicksW(#[serde(with = "super::ticks_ms")] Ticks);

    #[test]
    fn ticks_round_trip_as_ms() {
        let tests = [
            (0u64, "0.0"),
            (500, "0.5"),
            (1_000, "1.0"),
            (1_234_567, "1234.567"),
        ];
        for (ticks, expected) in tests {
            let serialized = serde_json::to_string(&TicksW(ticks)).unwrap();
            assert_eq!(serialized, expected);
            let back: TicksW = serde_json::from_str(&serialized).unwrap();
            assert_eq!(back, TicksW(ticks));
        }
    }
}
