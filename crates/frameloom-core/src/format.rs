//! Frame format descriptors for video and audio.
//!
//! A video format is identified by a packed 32-bit ID:
//! `(colorFamily:4, sampleType:4, bitsPerSample:8, subSamplingW:8,
//! subSamplingH:8)`. IDs from the previous API generation occupy the low
//! 24 bits with the top byte zero and resolve through the registry of
//! named presets instead.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Number of samples carried by every audio frame except possibly the
/// last one of a stream.
pub const AUDIO_FRAME_SAMPLES: i64 = 3072;

/// Color family of a video format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ColorFamily {
    /// Variable or not-yet-known format.
    #[default]
    Undefined,
    Gray,
    Rgb,
    Yuv,
    /// Packed BGR32 accepted only by compat-enabled plugins.
    CompatBgr32,
    /// Packed YUY2 accepted only by compat-enabled plugins.
    CompatYuy2,
}

impl ColorFamily {
    /// Numeric code used in packed format IDs.
    pub fn code(self) -> u32 {
        match self {
            Self::Undefined => 0,
            Self::Gray => 1,
            Self::Rgb => 2,
            Self::Yuv => 3,
            Self::CompatBgr32 => 4,
            Self::CompatYuy2 => 5,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Undefined),
            1 => Some(Self::Gray),
            2 => Some(Self::Rgb),
            3 => Some(Self::Yuv),
            4 => Some(Self::CompatBgr32),
            5 => Some(Self::CompatYuy2),
            _ => None,
        }
    }

    /// Whether this family exists only for compat-enabled plugins.
    pub fn is_compat(self) -> bool {
        matches!(self, Self::CompatBgr32 | Self::CompatYuy2)
    }
}

/// Sample type of a format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SampleType {
    #[default]
    Integer,
    Float,
}

impl SampleType {
    pub fn code(self) -> u32 {
        match self {
            Self::Integer => 0,
            Self::Float => 1,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::Integer),
            1 => Some(Self::Float),
            _ => None,
        }
    }
}

/// Descriptor of a planar video format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct VideoFormat {
    pub color_family: ColorFamily,
    pub sample_type: SampleType,
    pub bits_per_sample: i32,
    pub bytes_per_sample: i32,
    pub sub_sampling_w: i32,
    pub sub_sampling_h: i32,
    pub num_planes: i32,
}

/// Descriptor of a packed audio format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_type: SampleType,
    pub bits_per_sample: i32,
    pub bytes_per_sample: i32,
    pub channel_layout: u64,
    pub num_channels: i32,
}

fn bytes_for_bits(bits: i32) -> i32 {
    let mut bytes = 1;
    while bytes * 8 < bits {
        bytes <<= 1;
    }
    bytes
}

/// Validity rules for the individual video format fields.
pub fn is_valid_video_format(
    color_family: ColorFamily,
    sample_type: SampleType,
    bits_per_sample: i32,
    sub_sampling_w: i32,
    sub_sampling_h: i32,
) -> bool {
    if color_family == ColorFamily::Undefined {
        // Variable format carries no other constraints worth checking.
        return sub_sampling_w == 0
            && sub_sampling_h == 0
            && bits_per_sample == 0
            && sample_type == SampleType::Integer;
    }

    if sample_type == SampleType::Float && bits_per_sample != 16 && bits_per_sample != 32 {
        return false;
    }

    if !(0..=4).contains(&sub_sampling_w) || !(0..=4).contains(&sub_sampling_h) {
        return false;
    }

    if matches!(color_family, ColorFamily::Rgb | ColorFamily::Gray)
        && (sub_sampling_w != 0 || sub_sampling_h != 0)
    {
        return false;
    }

    if !(8..=32).contains(&bits_per_sample) {
        return false;
    }

    if color_family == ColorFamily::CompatBgr32
        && (sub_sampling_w != 0
            || sub_sampling_h != 0
            || bits_per_sample != 32
            || sample_type != SampleType::Integer)
    {
        return false;
    }

    if color_family == ColorFamily::CompatYuy2
        && (sub_sampling_w != 1
            || sub_sampling_h != 0
            || bits_per_sample != 16
            || sample_type != SampleType::Integer)
    {
        return false;
    }

    true
}

/// Validity rules for audio format fields.
pub fn is_valid_audio_format(
    sample_type: SampleType,
    bits_per_sample: i32,
    channel_layout: u64,
) -> bool {
    if !(16..=32).contains(&bits_per_sample) {
        return false;
    }

    if sample_type == SampleType::Float && bits_per_sample != 32 {
        return false;
    }

    channel_layout != 0
}

impl VideoFormat {
    /// Build a format from its fields, or `None` when the combination is
    /// invalid. `Undefined` yields the all-zero variable format.
    pub fn query(
        color_family: ColorFamily,
        sample_type: SampleType,
        bits_per_sample: i32,
        sub_sampling_w: i32,
        sub_sampling_h: i32,
    ) -> Option<Self> {
        if color_family == ColorFamily::Undefined {
            return Some(Self::default());
        }

        if !is_valid_video_format(
            color_family,
            sample_type,
            bits_per_sample,
            sub_sampling_w,
            sub_sampling_h,
        ) {
            return None;
        }

        let num_planes = match color_family {
            ColorFamily::Gray | ColorFamily::CompatBgr32 | ColorFamily::CompatYuy2 => 1,
            _ => 3,
        };

        Some(Self {
            color_family,
            sample_type,
            bits_per_sample,
            bytes_per_sample: bytes_for_bits(bits_per_sample),
            sub_sampling_w,
            sub_sampling_h,
            num_planes,
        })
    }

    /// Packed 32-bit ID, or 0 for an invalid combination.
    pub fn id(&self) -> u32 {
        video_format_id(
            self.color_family,
            self.sample_type,
            self.bits_per_sample,
            self.sub_sampling_w,
            self.sub_sampling_h,
        )
    }

    /// Human-readable name, e.g. `YUV420P8`, `GrayH`, `RGBS`.
    pub fn name(&self) -> Option<String> {
        if !is_valid_video_format(
            self.color_family,
            self.sample_type,
            self.bits_per_sample,
            self.sub_sampling_w,
            self.sub_sampling_h,
        ) {
            return None;
        }

        let st = match (self.sample_type, self.bits_per_sample) {
            (SampleType::Float, 32) => "S",
            (SampleType::Float, _) => "H",
            _ => "",
        };

        Some(match self.color_family {
            ColorFamily::Gray => format!("Gray{}{}", st, self.bits_per_sample),
            ColorFamily::Rgb => format!("RGB{}{}", st, self.bits_per_sample * 3),
            ColorFamily::Yuv => {
                let ss = match (self.sub_sampling_w, self.sub_sampling_h) {
                    (1, 1) => Some("420"),
                    (1, 0) => Some("422"),
                    (0, 0) => Some("444"),
                    (2, 2) => Some("410"),
                    (2, 0) => Some("411"),
                    (0, 1) => Some("440"),
                    _ => None,
                };
                match ss {
                    Some(ss) => format!("YUV{}P{}{}", ss, st, self.bits_per_sample),
                    None => format!(
                        "YUVssw{}ssh{}P{}{}",
                        self.sub_sampling_w, self.sub_sampling_h, st, self.bits_per_sample
                    ),
                }
            }
            ColorFamily::CompatBgr32 => "CompatBGR32".to_string(),
            ColorFamily::CompatYuy2 => "CompatYUY2".to_string(),
            ColorFamily::Undefined => "Undefined".to_string(),
        })
    }
}

impl AudioFormat {
    /// Build an audio format, or `None` when the fields are invalid.
    pub fn query(sample_type: SampleType, bits_per_sample: i32, channel_layout: u64) -> Option<Self> {
        if !is_valid_audio_format(sample_type, bits_per_sample, channel_layout) {
            return None;
        }

        Some(Self {
            sample_type,
            bits_per_sample,
            bytes_per_sample: bytes_for_bits(bits_per_sample),
            channel_layout,
            num_channels: channel_layout.count_ones() as i32,
        })
    }

    /// Human-readable name, e.g. `Audio16 (2 CH)`.
    pub fn name(&self) -> Option<String> {
        if !is_valid_audio_format(self.sample_type, self.bits_per_sample, self.channel_layout) {
            return None;
        }
        Some(match self.sample_type {
            SampleType::Float => format!("Audio{}F ({} CH)", self.bits_per_sample, self.num_channels),
            SampleType::Integer => format!("Audio{} ({} CH)", self.bits_per_sample, self.num_channels),
        })
    }
}

/// Pack video format fields into the 32-bit ID, or 0 when invalid.
pub fn video_format_id(
    color_family: ColorFamily,
    sample_type: SampleType,
    bits_per_sample: i32,
    sub_sampling_w: i32,
    sub_sampling_h: i32,
) -> u32 {
    if !is_valid_video_format(
        color_family,
        sample_type,
        bits_per_sample,
        sub_sampling_w,
        sub_sampling_h,
    ) {
        return 0;
    }
    ((color_family.code() & 0xF) << 28)
        | ((sample_type.code() & 0xF) << 24)
        | (((bits_per_sample as u32) & 0xFF) << 16)
        | (((sub_sampling_w as u32) & 0xFF) << 8)
        | ((sub_sampling_h as u32) & 0xFF)
}

/// Legacy IDs occupy the low 24 bits with the top byte zero.
pub fn is_legacy_format_id(id: u32) -> bool {
    (id & 0xFF00_0000) == 0 && (id & 0x00FF_FFFF) != 0
}

// ── Legacy generation formats ──────────────────────────────────

/// Color families of the previous API generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LegacyColorFamily {
    Gray,
    Rgb,
    Yuv,
    YCoCg,
    Compat,
}

impl LegacyColorFamily {
    /// Base value of the legacy ID range for this family.
    pub const fn base(self) -> i32 {
        match self {
            Self::Gray => 1_000_000,
            Self::Rgb => 2_000_000,
            Self::Yuv => 3_000_000,
            Self::YCoCg => 4_000_000,
            Self::Compat => 9_000_000,
        }
    }

    /// Translate into the current generation's family.
    pub fn to_current(self) -> Option<ColorFamily> {
        match self {
            Self::Gray => Some(ColorFamily::Gray),
            Self::Rgb => Some(ColorFamily::Rgb),
            Self::Yuv | Self::YCoCg => Some(ColorFamily::Yuv),
            Self::Compat => None,
        }
    }

    /// Translate a current family into the legacy one; compat and
    /// undefined families have no counterpart.
    pub fn from_current(family: ColorFamily) -> Option<Self> {
        match family {
            ColorFamily::Gray => Some(Self::Gray),
            ColorFamily::Rgb => Some(Self::Rgb),
            ColorFamily::Yuv => Some(Self::Yuv),
            _ => None,
        }
    }
}

/// A registered legacy-generation format: a named descriptor with a
/// small integer ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyVideoFormat {
    pub name: String,
    pub id: i32,
    pub color_family: LegacyColorFamily,
    pub sample_type: SampleType,
    pub bits_per_sample: i32,
    pub bytes_per_sample: i32,
    pub sub_sampling_w: i32,
    pub sub_sampling_h: i32,
    pub num_planes: i32,
}

impl LegacyVideoFormat {
    /// Translate into the current generation's descriptor.
    pub fn to_current(&self) -> Option<VideoFormat> {
        match self.color_family {
            LegacyColorFamily::Compat => {
                if self.id == preset::COMPAT_BGR32 {
                    VideoFormat::query(ColorFamily::CompatBgr32, SampleType::Integer, 32, 0, 0)
                } else if self.id == preset::COMPAT_YUY2 {
                    VideoFormat::query(ColorFamily::CompatYuy2, SampleType::Integer, 16, 1, 0)
                } else {
                    None
                }
            }
            family => VideoFormat::query(
                family.to_current()?,
                self.sample_type,
                self.bits_per_sample,
                self.sub_sampling_w,
                self.sub_sampling_h,
            ),
        }
    }
}

/// Well-known legacy preset IDs.
pub mod preset {
    use super::LegacyColorFamily;

    pub const GRAY8: i32 = LegacyColorFamily::Gray.base() + 10;
    pub const GRAY16: i32 = LegacyColorFamily::Gray.base() + 11;
    pub const GRAY_H: i32 = LegacyColorFamily::Gray.base() + 12;
    pub const GRAY_S: i32 = LegacyColorFamily::Gray.base() + 13;

    pub const YUV420P8: i32 = LegacyColorFamily::Yuv.base() + 10;
    pub const YUV422P8: i32 = LegacyColorFamily::Yuv.base() + 11;
    pub const YUV444P8: i32 = LegacyColorFamily::Yuv.base() + 12;
    pub const YUV410P8: i32 = LegacyColorFamily::Yuv.base() + 13;
    pub const YUV411P8: i32 = LegacyColorFamily::Yuv.base() + 14;
    pub const YUV440P8: i32 = LegacyColorFamily::Yuv.base() + 15;
    pub const YUV420P9: i32 = LegacyColorFamily::Yuv.base() + 16;
    pub const YUV422P9: i32 = LegacyColorFamily::Yuv.base() + 17;
    pub const YUV444P9: i32 = LegacyColorFamily::Yuv.base() + 18;
    pub const YUV420P10: i32 = LegacyColorFamily::Yuv.base() + 19;
    pub const YUV422P10: i32 = LegacyColorFamily::Yuv.base() + 20;
    pub const YUV444P10: i32 = LegacyColorFamily::Yuv.base() + 21;
    pub const YUV420P12: i32 = LegacyColorFamily::Yuv.base() + 22;
    pub const YUV422P12: i32 = LegacyColorFamily::Yuv.base() + 23;
    pub const YUV444P12: i32 = LegacyColorFamily::Yuv.base() + 24;
    pub const YUV420P14: i32 = LegacyColorFamily::Yuv.base() + 25;
    pub const YUV422P14: i32 = LegacyColorFamily::Yuv.base() + 26;
    pub const YUV444P14: i32 = LegacyColorFamily::Yuv.base() + 27;
    pub const YUV420P16: i32 = LegacyColorFamily::Yuv.base() + 28;
    pub const YUV422P16: i32 = LegacyColorFamily::Yuv.base() + 29;
    pub const YUV444P16: i32 = LegacyColorFamily::Yuv.base() + 30;
    pub const YUV444P_H: i32 = LegacyColorFamily::Yuv.base() + 31;
    pub const YUV444P_S: i32 = LegacyColorFamily::Yuv.base() + 32;

    pub const RGB24: i32 = LegacyColorFamily::Rgb.base() + 10;
    pub const RGB27: i32 = LegacyColorFamily::Rgb.base() + 11;
    pub const RGB30: i32 = LegacyColorFamily::Rgb.base() + 12;
    pub const RGB48: i32 = LegacyColorFamily::Rgb.base() + 13;
    pub const RGB_H: i32 = LegacyColorFamily::Rgb.base() + 14;
    pub const RGB_S: i32 = LegacyColorFamily::Rgb.base() + 15;

    pub const COMPAT_BGR32: i32 = LegacyColorFamily::Compat.base() + 10;
    pub const COMPAT_YUY2: i32 = LegacyColorFamily::Compat.base() + 11;
}

/// Registry of named legacy formats. New formats registered without an
/// explicit ID get one assigned from a per-registry offset.
pub struct FormatRegistry {
    inner: Mutex<RegistryInner>,
}

struct RegistryInner {
    formats: Vec<LegacyVideoFormat>,
    id_offset: i32,
}

impl FormatRegistry {
    pub fn new() -> Self {
        let registry = Self {
            inner: Mutex::new(RegistryInner {
                formats: Vec::new(),
                id_offset: 1000,
            }),
        };
        registry.register_presets();
        registry
    }

    /// Look up or register a legacy format. Matching is on the format
    /// fields; `name` and `id` only apply when a new entry is created.
    pub fn query(
        &self,
        color_family: LegacyColorFamily,
        sample_type: SampleType,
        bits_per_sample: i32,
        sub_sampling_w: i32,
        sub_sampling_h: i32,
        name: Option<&str>,
        id: Option<i32>,
    ) -> Option<LegacyVideoFormat> {
        if !(0..=4).contains(&sub_sampling_w) || !(0..=4).contains(&sub_sampling_h) {
            return None;
        }
        if color_family == LegacyColorFamily::Rgb && (sub_sampling_w != 0 || sub_sampling_h != 0) {
            return None;
        }
        if sample_type == SampleType::Float && bits_per_sample != 16 && bits_per_sample != 32 {
            return None;
        }
        if !(8..=32).contains(&bits_per_sample) {
            return None;
        }
        if color_family == LegacyColorFamily::Compat && name.is_none() {
            return None;
        }

        let mut inner = self.inner.lock();

        if let Some(existing) = inner.formats.iter().find(|f| {
            f.color_family == color_family
                && f.sample_type == sample_type
                && f.bits_per_sample == bits_per_sample
                && f.sub_sampling_w == sub_sampling_w
                && f.sub_sampling_h == sub_sampling_h
        }) {
            return Some(existing.clone());
        }

        let name = match name {
            Some(n) => n.to_string(),
            None => synthesize_legacy_name(
                color_family,
                sample_type,
                bits_per_sample,
                sub_sampling_w,
                sub_sampling_h,
            ),
        };

        let id = match id {
            Some(id) if id != 0 => id,
            _ => {
                let id = color_family.base() + inner.id_offset;
                inner.id_offset += 1;
                id
            }
        };

        let format = LegacyVideoFormat {
            name,
            id,
            color_family,
            sample_type,
            bits_per_sample,
            bytes_per_sample: bytes_for_bits(bits_per_sample),
            sub_sampling_w,
            sub_sampling_h,
            num_planes: match color_family {
                LegacyColorFamily::Gray | LegacyColorFamily::Compat => 1,
                _ => 3,
            },
        };
        inner.formats.push(format.clone());
        Some(format)
    }

    /// Fetch a registered format by its legacy ID.
    pub fn by_id(&self, id: i32) -> Option<LegacyVideoFormat> {
        self.inner.lock().formats.iter().find(|f| f.id == id).cloned()
    }

    /// Number of registered formats.
    pub fn len(&self) -> usize {
        self.inner.lock().formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn register_presets(&self) {
        use LegacyColorFamily::{Compat, Gray, Rgb, Yuv};
        use SampleType::{Float, Integer};

        let presets: &[(LegacyColorFamily, SampleType, i32, i32, i32, &str, i32)] = &[
            (Gray, Integer, 8, 0, 0, "Gray8", preset::GRAY8),
            (Gray, Integer, 16, 0, 0, "Gray16", preset::GRAY16),
            (Gray, Float, 16, 0, 0, "GrayH", preset::GRAY_H),
            (Gray, Float, 32, 0, 0, "GrayS", preset::GRAY_S),
            (Yuv, Integer, 8, 1, 1, "YUV420P8", preset::YUV420P8),
            (Yuv, Integer, 8, 1, 0, "YUV422P8", preset::YUV422P8),
            (Yuv, Integer, 8, 0, 0, "YUV444P8", preset::YUV444P8),
            (Yuv, Integer, 8, 2, 2, "YUV410P8", preset::YUV410P8),
            (Yuv, Integer, 8, 2, 0, "YUV411P8", preset::YUV411P8),
            (Yuv, Integer, 8, 0, 1, "YUV440P8", preset::YUV440P8),
            (Yuv, Integer, 9, 1, 1, "YUV420P9", preset::YUV420P9),
            (Yuv, Integer, 9, 1, 0, "YUV422P9", preset::YUV422P9),
            (Yuv, Integer, 9, 0, 0, "YUV444P9", preset::YUV444P9),
            (Yuv, Integer, 10, 1, 1, "YUV420P10", preset::YUV420P10),
            (Yuv, Integer, 10, 1, 0, "YUV422P10", preset::YUV422P10),
            (Yuv, Integer, 10, 0, 0, "YUV444P10", preset::YUV444P10),
            (Yuv, Integer, 12, 1, 1, "YUV420P12", preset::YUV420P12),
            (Yuv, Integer, 12, 1, 0, "YUV422P12", preset::YUV422P12),
            (Yuv, Integer, 12, 0, 0, "YUV444P12", preset::YUV444P12),
            (Yuv, Integer, 14, 1, 1, "YUV420P14", preset::YUV420P14),
            (Yuv, Integer, 14, 1, 0, "YUV422P14", preset::YUV422P14),
            (Yuv, Integer, 14, 0, 0, "YUV444P14", preset::YUV444P14),
            (Yuv, Integer, 16, 1, 1, "YUV420P16", preset::YUV420P16),
            (Yuv, Integer, 16, 1, 0, "YUV422P16", preset::YUV422P16),
            (Yuv, Integer, 16, 0, 0, "YUV444P16", preset::YUV444P16),
            (Yuv, Float, 16, 0, 0, "YUV444PH", preset::YUV444P_H),
            (Yuv, Float, 32, 0, 0, "YUV444PS", preset::YUV444P_S),
            (Rgb, Integer, 8, 0, 0, "RGB24", preset::RGB24),
            (Rgb, Integer, 9, 0, 0, "RGB27", preset::RGB27),
            (Rgb, Integer, 10, 0, 0, "RGB30", preset::RGB30),
            (Rgb, Integer, 16, 0, 0, "RGB48", preset::RGB48),
            (Rgb, Float, 16, 0, 0, "RGBH", preset::RGB_H),
            (Rgb, Float, 32, 0, 0, "RGBS", preset::RGB_S),
            (Compat, Integer, 32, 0, 0, "CompatBGR32", preset::COMPAT_BGR32),
            (Compat, Integer, 16, 1, 0, "CompatYUY2", preset::COMPAT_YUY2),
        ];

        for &(family, st, bits, ssw, ssh, name, id) in presets {
            self.query(family, st, bits, ssw, ssh, Some(name), Some(id));
        }
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn synthesize_legacy_name(
    color_family: LegacyColorFamily,
    sample_type: SampleType,
    bits_per_sample: i32,
    sub_sampling_w: i32,
    sub_sampling_h: i32,
) -> String {
    let st = match (sample_type, bits_per_sample) {
        (SampleType::Float, 32) => "S",
        (SampleType::Float, _) => "H",
        _ => "",
    };

    match color_family {
        LegacyColorFamily::Gray => format!("Gray{}{}", st, bits_per_sample),
        LegacyColorFamily::Rgb => format!("RGB{}{}", st, bits_per_sample * 3),
        LegacyColorFamily::Yuv => {
            let ss = match (sub_sampling_w, sub_sampling_h) {
                (1, 1) => Some("420"),
                (1, 0) => Some("422"),
                (0, 0) => Some("444"),
                (2, 2) => Some("410"),
                (2, 0) => Some("411"),
                (0, 1) => Some("440"),
                _ => None,
            };
            match ss {
                Some(ss) => format!("YUV{}P{}{}", ss, st, bits_per_sample),
                None => format!(
                    "YUVssw{}ssh{}P{}{}",
                    sub_sampling_w, sub_sampling_h, st, bits_per_sample
                ),
            }
        }
        LegacyColorFamily::YCoCg => format!(
            "YCoCgssw{}ssh{}P{}{}",
            sub_sampling_w, sub_sampling_h, st, bits_per_sample
        ),
        LegacyColorFamily::Compat => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn yuv420p8_descriptor() {
        let f = VideoFormat::query(ColorFamily::Yuv, SampleType::Integer, 8, 1, 1).unwrap();
        assert_eq!(f.num_planes, 3);
        assert_eq!(f.bytes_per_sample, 1);
        assert_eq!(f.name().unwrap(), "YUV420P8");
    }

    #[test]
    fn bytes_per_sample_rounds_up() {
        let f = VideoFormat::query(ColorFamily::Yuv, SampleType::Integer, 10, 1, 1).unwrap();
        assert_eq!(f.bytes_per_sample, 2);
        assert_eq!(f.name().unwrap(), "YUV420P10");
    }

    #[test]
    fn id_round_trip() {
        let f = VideoFormat::query(ColorFamily::Rgb, SampleType::Float, 32, 0, 0).unwrap();
        let id = f.id();
        assert!(!is_legacy_format_id(id));
        assert_eq!((id >> 28) & 0xF, ColorFamily::Rgb.code());
        assert_eq!((id >> 24) & 0xF, SampleType::Float.code());
        assert_eq!((id >> 16) & 0xFF, 32);
        assert_eq!(f.name().unwrap(), "RGBS");
    }

    #[test]
    fn rgb_rejects_subsampling() {
        assert!(VideoFormat::query(ColorFamily::Rgb, SampleType::Integer, 8, 1, 1).is_none());
    }

    #[test]
    fn float_bits_restricted() {
        assert!(VideoFormat::query(ColorFamily::Yuv, SampleType::Float, 24, 0, 0).is_none());
        assert!(VideoFormat::query(ColorFamily::Yuv, SampleType::Float, 16, 0, 0).is_some());
    }

    #[test]
    fn undefined_is_variable() {
        let f = VideoFormat::query(ColorFamily::Undefined, SampleType::Integer, 0, 0, 0).unwrap();
        assert_eq!(f, VideoFormat::default());
        assert_eq!(f.id(), 0);
    }

    #[test]
    fn audio_format_channels_from_layout() {
        // Stereo: front left + front right.
        let f = AudioFormat::query(SampleType::Integer, 16, 0b11).unwrap();
        assert_eq!(f.num_channels, 2);
        assert_eq!(f.bytes_per_sample, 2);
        assert_eq!(f.name().unwrap(), "Audio16 (2 CH)");
    }

    #[test]
    fn audio_format_rejects_bad_fields() {
        assert!(AudioFormat::query(SampleType::Integer, 8, 0b11).is_none());
        assert!(AudioFormat::query(SampleType::Float, 16, 0b11).is_none());
        assert!(AudioFormat::query(SampleType::Integer, 16, 0).is_none());
    }

    #[test]
    fn legacy_registry_presets() {
        let reg = FormatRegistry::new();
        let f = reg.by_id(preset::YUV420P8).unwrap();
        assert_eq!(f.name, "YUV420P8");
        assert_eq!(f.num_planes, 3);
        assert_eq!(f.to_current().unwrap().sub_sampling_w, 1);
    }

    #[test]
    fn legacy_registry_assigns_ids() {
        let reg = FormatRegistry::new();
        // 11-bit YUV 4:2:0 is not a preset; gets an offset-assigned ID.
        let f = reg
            .query(LegacyColorFamily::Yuv, SampleType::Integer, 11, 1, 1, None, None)
            .unwrap();
        assert_eq!(f.id, LegacyColorFamily::Yuv.base() + 1000);
        assert_eq!(f.name, "YUV420P11");
        // Querying the same fields again returns the same registration.
        let again = reg
            .query(LegacyColorFamily::Yuv, SampleType::Integer, 11, 1, 1, None, None)
            .unwrap();
        assert_eq!(again.id, f.id);
    }

    #[test]
    fn legacy_compat_requires_name() {
        let reg = FormatRegistry::new();
        assert!(reg
            .query(LegacyColorFamily::Compat, SampleType::Integer, 24, 0, 0, None, None)
            .is_none());
    }

    #[test]
    fn legacy_family_mapping() {
        assert_eq!(LegacyColorFamily::YCoCg.to_current(), Some(ColorFamily::Yuv));
        assert_eq!(LegacyColorFamily::from_current(ColorFamily::Yuv), Some(LegacyColorFamily::Yuv));
        assert_eq!(LegacyColorFamily::from_current(ColorFamily::CompatYuy2), None);
    }
}
