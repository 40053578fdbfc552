use std::{
    fmt::{self, Display},
    str::FromStr,
};

use serde_with::{DeserializeFromStr, SerializeDisplay};

/// A short channel id: the compact `(block_height, tx_index, output_index)`
/// identifier a channel receives once its funding tx is buried deep enough.
/// Stored big-endian as 3 + 3 + 2 bytes.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq, Ord, PartialOrd)]
#[derive(SerializeDisplay, DeserializeFromStr)]
pub struct ShortChannelId([u8; 8]);

impl ShortChannelId {
    pub fn from_components(
        block_height: u32,
        tx_index: u32,
        output_index: u16,
    ) -> Self {
        let bh = block_height.to_be_bytes();
        let tx = tx_index.to_be_bytes();
        let oi = output_index.to_be_bytes();
        Self([bh[1], bh[2], bh[3], tx[1], tx[2], tx[3], oi[0], oi[1]])
    }

    pub fn block_height(&self) -> u32 {
        u32::from_be_bytes([0, self.0[0], self.0[1], self.0[2]])
    }

    pub fn tx_index(&self) -> u32 {
        u32::from_be_bytes([0, self.0[3], self.0[4], self.0[5]])
    }

    pub fn output_index(&self) -> u16 {
        u16::from_be_bytes([self.0[6], self.0[7]])
    }

    pub fn to_bytes(self) -> [u8; 8] {
        self.0
    }

    pub fn from_bytes(bytes: [u8; 8]) -> Self {
        Self(bytes)
    }
}

/// `<block_height>x<tx_index>x<output_index>`
impl Display for ShortChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}x{}",
            self.block_height(),
            self.tx_index(),
            self.output_index()
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Invalid short channel id: {0}")]
pub struct InvalidShortChannelId(String);

impl FromStr for ShortChannelId {
    type Err = InvalidShortChannelId;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || InvalidShortChannelId(s.to_owned());
        let mut parts = s.split('x');
        let block_height = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .filter(|bh| *bh < (1 << 24))
            .ok_or_else(bad)?;
        let tx_index = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .filter(|tx| *tx < (1 << 24))
            .ok_or_else(bad)?;
        let output_index = parts
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .ok_or_else(bad)?;
        if parts.next().is_some() {
            return Err(bad());
        }
        Ok(Self::from_components(block_height, tx_index, output_index))
    }
}

#[cfg(test)]
mod test {
    use proptest::{prop_assert_eq, proptest};

    use super::*;

    #[test]
    fn components_roundtrip() {
        let scid = ShortChannelId::from_components(572_407, 1_841, 0);
        assert_eq!(scid.block_height(), 572_407);
        assert_eq!(scid.tx_index(), 1_841);
        assert_eq!(scid.output_index(), 0);
        assert_eq!(scid.to_string(), "572407x1841x0");
        assert_eq!(ShortChannelId::from_str("572407x1841x0").unwrap(), scid);
    }

    #[test]
    fn rejects_malformed_strings() {
        assert!(ShortChannelId::from_str("").is_err());
        assert!(ShortChannelId::from_str("1x2").is_err());
        assert!(ShortChannelId::from_str("1x2x3x4").is_err());
        assert!(ShortChannelId::from_str("99999999x0x0").is_err());
    }

    proptest! {
        #[test]
        fn display_fromstr_roundtrip(
            block_height in 0u32..(1 << 24),
            tx_index in 0u32..(1 << 24),
            output_index in proptest::arbitrary::any::<u16>(),
        ) {
            let scid = ShortChannelId::from_components(
                block_height,
                tx_index,
                output_index,
            );
            let parsed =
                ShortChannelId::from_str(&scid.to_string()).unwrap();
            prop_assert_eq!(scid, parsed);
        }
    }
}
