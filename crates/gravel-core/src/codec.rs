//! Element codecs: fixed-size encode/decode over mapped host windows.
//!
//! A codec describes how one logical element is laid out in device memory.
//! The engine only ever uses the three capabilities below; everything else
//! about the element type is opaque to it. Encoded size must divide both
//! the map window and the dust-buffer size.

/// Fixed-size element codec.
pub trait ElementCodec: Send + Sync {
    /// The element type this codec encodes.
    type Elem;

    /// Encoded size of one element in bytes. Constant for the lifetime of
    /// the codec.
    fn size_of(&self) -> usize;

    /// Encode one value at element index `index` into `window`.
    fn encode(&self, index: usize, window: &mut [u8], value: &Self::Elem);

    /// Decode the value at element index `index` from `window`.
    fn decode(&self, index: usize, window: &[u8]) -> Self::Elem;
}

macro_rules! le_codec {
    ($(#[$doc:meta])* $name:ident, $ty:ty) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $name;

        impl ElementCodec for $name {
            type Elem = $ty;

            fn size_of(&self) -> usize {
                std::mem::size_of::<$ty>()
            }

            fn encode(&self, index: usize, window: &mut [u8], value: &$ty) {
                let at = index * std::mem::size_of::<$ty>();
                window[at..at + std::mem::size_of::<$ty>()]
                    .copy_from_slice(&value.to_le_bytes());
            }

            fn decode(&self, index: usize, window: &[u8]) -> $ty {
                let at = index * std::mem::size_of::<$ty>();
                let size = std::mem::size_of::<$ty>();
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(&window[at..at + size]);
                <$ty>::from_le_bytes(raw)
            }
        }
    };
}

le_codec!(
    /// Little-endian `u32` codec (4 bytes per element).
    U32Codec,
    u32
);
le_codec!(
    /// Little-endian `u64` codec (8 bytes per element).
    U64Codec,
    u64
);
le_codec!(
    /// Little-endian IEEE-754 `f32` codec (4 bytes per element).
    F32Codec,
    f32
);
le_codec!(
    /// Little-endian IEEE-754 `f64` codec (8 bytes per element).
    F64Codec,
    f64
);
