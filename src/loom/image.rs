use std::sync::LazyLock;

use derive_more::Display;
use itertools::iproduct;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use super::error::Error;

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ChannelOrder {
    R,
    A,
    Rg,
    Ra,
    Rgb,
    Rgba,
    Bgra,
    Argb,
    Intensity,
    Luminance,
    Rx,
    Rgx,
    Rgbx,
}

impl ChannelOrder {
    pub const fn code(self) -> u32 {
        0x10B0
            + match self {
                ChannelOrder::R => 0,
                ChannelOrder::A => 1,
                ChannelOrder::Rg => 2,
                ChannelOrder::Ra => 3,
                ChannelOrder::Rgb => 4,
                ChannelOrder::Rgba => 5,
                ChannelOrder::Bgra => 6,
                ChannelOrder::Argb => 7,
                ChannelOrder::Intensity => 8,
                ChannelOrder::Luminance => 9,
                ChannelOrder::Rx => 10,
                ChannelOrder::Rgx => 11,
                ChannelOrder::Rgbx => 12,
            }
    }

    pub const fn channels(self) -> usize {
        match self {
            ChannelOrder::R
            | ChannelOrder::A
            | ChannelOrder::Rx
            | ChannelOrder::Intensity
            | ChannelOrder::Luminance => 1,
            ChannelOrder::Rg | ChannelOrder::Ra | ChannelOrder::Rgx => 2,
            ChannelOrder::Rgb | ChannelOrder::Rgbx => 3,
            ChannelOrder::Rgba | ChannelOrder::Bgra | ChannelOrder::Argb => 4,
        }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ChannelType {
    SnormInt8,
    SnormInt16,
    UnormInt8,
    UnormInt16,
    UnormShort565,
    UnormShort555,
    UnormInt101010,
    SignedInt8,
    SignedInt16,
    SignedInt32,
    UnsignedInt8,
    UnsignedInt16,
    UnsignedInt32,
    HalfFloat,
    Float,
}

impl ChannelType {
    pub const ALL: [ChannelType; 15] = [
        ChannelType::SnormInt8,
        ChannelType::SnormInt16,
        ChannelType::UnormInt8,
        ChannelType::UnormInt16,
        ChannelType::UnormShort565,
        ChannelType::UnormShort555,
        ChannelType::UnormInt101010,
        ChannelType::SignedInt8,
        ChannelType::SignedInt16,
        ChannelType::SignedInt32,
        ChannelType::UnsignedInt8,
        ChannelType::UnsignedInt16,
        ChannelType::UnsignedInt32,
        ChannelType::HalfFloat,
        ChannelType::Float,
    ];

    pub const fn code(self) -> u32 {
        0x10D0 + self as u32
    }

    /// Whether one value of this type packs every channel of a pixel.
    pub const fn is_packed(self) -> bool {
        matches!(
            self,
            ChannelType::UnormShort565 | ChannelType::UnormShort555 | ChannelType::UnormInt101010
        )
    }

    /// Size in bytes of one channel, or of the whole pixel for packed types.
    pub const fn size(self) -> usize {
        match self {
            ChannelType::SnormInt8 | ChannelType::UnormInt8 => 1,
            ChannelType::SignedInt8 | ChannelType::UnsignedInt8 => 1,
            ChannelType::SnormInt16 | ChannelType::UnormInt16 => 2,
            ChannelType::SignedInt16 | ChannelType::UnsignedInt16 => 2,
            ChannelType::HalfFloat => 2,
            ChannelType::UnormShort565 | ChannelType::UnormShort555 => 2,
            ChannelType::UnormInt101010 => 4,
            ChannelType::SignedInt32 | ChannelType::UnsignedInt32 => 4,
            ChannelType::Float => 4,
        }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[display("{order}/{data_type}")]
pub struct ImageFormat {
    pub order: ChannelOrder,
    pub data_type: ChannelType,
}

impl ImageFormat {
    #[inline]
    pub const fn new(order: ChannelOrder, data_type: ChannelType) -> Self {
        Self { order, data_type }
    }

    /// Bytes per pixel.
    #[inline]
    pub const fn element_size(self) -> usize {
        match self.data_type.is_packed() {
            true => self.data_type.size(),
            false => self.order.channels() * self.data_type.size(),
        }
    }
}

/// Formats both device backends accept for reading and writing.
pub static SUPPORTED_IMAGE_FORMATS: LazyLock<Vec<ImageFormat>> = LazyLock::new(|| {
    use ChannelOrder as O;
    use ChannelType as T;

    let general = iproduct!(
        [O::R, O::Rx, O::A, O::Rg, O::Rgx, O::Ra, O::Rgba],
        ChannelType::ALL
    );
    let intensity = iproduct!(
        [O::Intensity, O::Luminance],
        [
            T::UnormInt8,
            T::UnormInt16,
            T::SnormInt8,
            T::SnormInt16,
            T::HalfFloat,
            T::Float
        ]
    );
    let packed = iproduct!(
        [O::Rgb, O::Rgbx],
        [T::UnormShort565, T::UnormShort555, T::UnormInt101010]
    );
    let swizzled = iproduct!(
        [O::Argb, O::Bgra],
        [T::SnormInt8, T::UnormInt8, T::SignedInt8, T::UnsignedInt8]
    );

    general
        .chain(intensity)
        .chain(packed)
        .chain(swizzled)
        .map(|(order, data_type)| ImageFormat::new(order, data_type))
        .collect()
});

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum ImageType {
    Image1D,
    Image1DArray,
    Image2D,
    Image2DArray,
    Image3D,
}

/// Geometry of an image memory object. Pitches are in bytes; zero pitches take their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ImageDesc {
    pub r#type: ImageType,
    pub width: usize,
    pub height: usize,
    pub depth: usize,
    pub array_size: usize,
    pub row_pitch: usize,
    pub slice_pitch: usize,
}

impl ImageDesc {
    pub fn new_2d(width: usize, height: usize) -> Self {
        Self {
            r#type: ImageType::Image2D,
            width,
            height,
            depth: 1,
            array_size: 1,
            row_pitch: 0,
            slice_pitch: 0,
        }
    }

    pub fn new_3d(width: usize, height: usize, depth: usize) -> Self {
        Self {
            r#type: ImageType::Image3D,
            depth,
            ..Self::new_2d(width, height)
        }
    }

    #[inline]
    pub fn is_array(&self) -> bool {
        matches!(self.r#type, ImageType::Image1DArray | ImageType::Image2DArray)
    }

    /// Fills in default pitches and checks the geometry against `format`.
    pub fn normalize(self, format: ImageFormat) -> Result<Self, Error> {
        let (height, depth, array_size) = match self.r#type {
            ImageType::Image1D => (1, 1, 1),
            ImageType::Image1DArray => (1, 1, self.array_size),
            ImageType::Image2D => (self.height, 1, 1),
            ImageType::Image2DArray => (self.height, 1, self.array_size),
            ImageType::Image3D => (self.height, self.depth, 1),
        };
        if self.width == 0 || height == 0 || depth == 0 || array_size == 0 {
            return Err(Error::InvalidValue);
        }

        let min_row = self.width * format.element_size();
        let row_pitch = match self.row_pitch {
            0 => min_row,
            pitch if pitch < min_row => return Err(Error::InvalidValue),
            pitch => pitch,
        };
        let min_slice = row_pitch * height;
        let slice_pitch = match self.slice_pitch {
            0 => min_slice,
            pitch if pitch < min_slice => return Err(Error::InvalidValue),
            pitch => pitch,
        };

        Ok(Self {
            height,
            depth,
            array_size,
            row_pitch,
            slice_pitch,
            ..self
        })
    }

    /// Total bytes of a normalized image.
    #[inline]
    pub fn size(&self) -> usize {
        self.slice_pitch * self.depth * self.array_size
    }
}

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AddressingMode {
    #[default]
    None,
    MirroredRepeat,
    Repeat,
    ClampToEdge,
    Clamp,
}

#[derive(Debug, Default, Display, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum FilterMode {
    #[default]
    Nearest,
    Linear,
}

/// Image sampling state passed to kernels.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Sampler {
    pub normalized_coords: bool,
    pub addressing: AddressingMode,
    pub filter: FilterMode,
}

impl Sampler {
    /// Device encoding: addressing mode in the low bits, then normalization and filter flags.
    pub const fn bits(self) -> u32 {
        let addressing = match self.addressing {
            AddressingMode::None => 0,
            AddressingMode::MirroredRepeat => 1,
            AddressingMode::Repeat => 2,
            AddressingMode::ClampToEdge => 3,
            AddressingMode::Clamp => 4,
        };
        let normalized = if self.normalized_coords { 0x8 } else { 0 };
        let filter = match self.filter {
            FilterMode::Nearest => 0,
            FilterMode::Linear => 0x10,
        };
        addressing | normalized | filter
    }
}
