//! Flasher stub images
//!
//! Stubs are read from TOML files (converted from the JSON `esptool.py` ships)
//! named after the chip they run on, e.g. `esp32c3.toml`.

use std::{fs, ops::Range, path::Path};

use base64::{engine::general_purpose, Engine as _};
use serde::Deserialize;

use crate::{error::Error, targets::Chip};

/// Flash stub object, with its sections already decoded
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "RawFlashStub")]
pub struct FlashStub {
    /// Entry point (address)
    entry: u32,
    text: Vec<u8>,
    /// Start of text section address
    text_start: u32,
    data: Vec<u8>,
    /// Start of data section address
    data_start: u32,
}

/// A stub as stored on disk, sections base64 encoded
#[derive(Deserialize)]
struct RawFlashStub {
    entry: u32,
    text: String,
    text_start: u32,
    #[serde(default)]
    data: String,
    #[serde(default)]
    data_start: u32,
}

impl TryFrom<RawFlashStub> for FlashStub {
    type Error = String;

    fn try_from(raw: RawFlashStub) -> Result<Self, Self::Error> {
        let decode = |section: &str, encoded: &str| {
            general_purpose::STANDARD
                .decode(encoded)
                .map_err(|err| format!("{section} section is not valid base64: {err}"))
        };

        Ok(FlashStub {
            entry: raw.entry,
            text: decode("text", &raw.text)?,
            text_start: raw.text_start,
            data: decode("data", &raw.data)?,
            data_start: raw.data_start,
        })
    }
}

impl FlashStub {
    pub fn new(entry: u32, text_start: u32, text: Vec<u8>, data_start: u32, data: Vec<u8>) -> Self {
        FlashStub {
            entry,
            text,
            text_start,
            data,
            data_start,
        }
    }

    /// Parse a stub from its TOML representation
    pub fn from_toml(s: &str) -> Result<Self, Error> {
        toml::from_str(s).map_err(|err| Error::InvalidStub(err.message().to_string()))
    }

    /// Load the stub for `chip` from `dir`
    pub fn load(dir: &Path, chip: Chip) -> Result<Self, Error> {
        let path = dir
            .join(chip.descriptor()?.stub_key)
            .with_extension("toml");

        let s = fs::read_to_string(&path)
            .map_err(|err| Error::FileOpenError(path.display().to_string(), err))?;

        Self::from_toml(&s)
    }

    /// Fetch stub entry point
    pub fn entry(&self) -> u32 {
        self.entry
    }

    /// Fetch text start address and bytes
    pub fn text(&self) -> (u32, &[u8]) {
        (self.text_start, &self.text)
    }

    /// Fetch data start address and bytes
    pub fn data(&self) -> (u32, &[u8]) {
        (self.data_start, &self.data)
    }

    /// Address ranges the stub occupies once loaded
    pub fn resident_ranges(&self) -> Vec<Range<u64>> {
        [(self.text_start, &self.text), (self.data_start, &self.data)]
            .into_iter()
            .filter(|(_, bytes)| !bytes.is_empty())
            .map(|(start, bytes)| start as u64..start as u64 + bytes.len() as u64)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const STUB: &str = r#"
entry = 1074521580
text = "AAECAwQFBgc="
text_start = 1074520064
data = "CAkKCw=="
data_start = 1073605544
"#;

    #[test]
    fn sections_are_decoded_on_load() {
        let stub = FlashStub::from_toml(STUB).unwrap();

        assert_eq!(stub.entry(), 0x400b_e5ec);
        assert_eq!(stub.text(), (0x400b_e000, &[0, 1, 2, 3, 4, 5, 6, 7][..]));
        assert_eq!(stub.data(), (0x3ffd_eba8, &[8, 9, 10, 11][..]));
    }

    #[test]
    fn data_section_is_optional() {
        let stub = FlashStub::from_toml(
            "entry = 4\ntext = \"AAECAw==\"\ntext_start = 0\n",
        )
        .unwrap();

        assert_eq!(stub.data().1, &[] as &[u8]);
        assert_eq!(stub.resident_ranges(), vec![0..4]);
    }

    #[test]
    fn resident_ranges_cover_both_sections() {
        let stub = FlashStub::from_toml(STUB).unwrap();

        assert_eq!(
            stub.resident_ranges(),
            vec![0x400b_e000..0x400b_e008, 0x3ffd_eba8..0x3ffd_ebac]
        );
    }

    #[test]
    fn sections_at_the_top_of_memory() {
        let stub = FlashStub::new(0, 0xffff_fff0, vec![0; 0x20], 0, Vec::new());
        assert_eq!(stub.resident_ranges(), vec![0xffff_fff0..0x1_0000_0010]);
    }

    #[test]
    fn bad_base64_is_an_invalid_stub() {
        let err = FlashStub::from_toml("entry = 0\ntext = \"!!\"\ntext_start = 0\n").unwrap_err();
        assert!(matches!(err, Error::InvalidStub(msg) if msg.contains("text")));
    }

    #[test]
    fn missing_stub_file() {
        let err = FlashStub::load(Path::new("/nonexistent"), Chip::Esp32).unwrap_err();
        match err {
            Error::FileOpenError(path, _) => assert!(path.ends_with("esp32.toml")),
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
