use crate::{Error, Result};

pub fn string_to_utf16(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(|unit| unit.to_le_bytes()).collect()
}

pub fn bytes_to_utf16_string(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(Error::InvalidParameter(String::from(
            "UTF-16 buffer has an odd number of bytes",
        )));
    }

    let units = bytes
        .chunks_exact(2)
        .map(|chunk| u16::from_le_bytes([chunk[0], chunk[1]]))
        .collect::<Vec<u16>>();

    String::from_utf16(&units).map_err(|_| Error::InvalidParameter(String::from("invalid UTF-16 data")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf16_round_trip() {
        let encoded = string_to_utf16("WORKSTATION7");

        assert_eq!(encoded.len(), 24);
        assert_eq!(bytes_to_utf16_string(&encoded).unwrap(), "WORKSTATION7");
    }
}
