//! Vertex attribute formats, per-attribute compaction, and the CPU reference
//! decoder.
//!
//! The rewritten compute shader fetches each attribute from a compacted raw
//! buffer and widens narrow components to 32 bits (half→float, byte/short →
//! 32-bit integers, 64-bit values reassembled from packed u32 pairs). The CPU
//! decoder here is the reference the GPU path must agree with bit-for-bit,
//! modulo the documented widening.

/// Component interpretation of a vertex format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompType {
    UNorm,
    SNorm,
    UInt,
    SInt,
    Float,
}

/// A vertex attribute format: component type, component width in bits, and
/// component count (1..=4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VertexFormat {
    pub comp: CompType,
    pub width: u32,
    pub count: u32,
}

impl VertexFormat {
    pub const fn new(comp: CompType, width: u32, count: u32) -> VertexFormat {
        VertexFormat { comp, width, count }
    }

    /// Raw byte size of one attribute value.
    pub fn byte_size(&self) -> u32 {
        (self.width / 8) * self.count
    }

    /// Byte size after widening to the 32-bit shader representation
    /// (64-bit components stay 8 bytes, carried as a u32 pair).
    pub fn widened_byte_size(&self) -> u32 {
        self.width.max(32) / 8 * self.count
    }
}

/// One decoded component, widened to its shader-visible representation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AttrComponent {
    F32(f32),
    I32(i32),
    U32(u32),
    F64(f64),
    I64(i64),
    U64(u64),
}

fn half_to_f32(bits: u16) -> f32 {
    let sign = u32::from(bits >> 15) << 31;
    let exp = u32::from((bits >> 10) & 0x1f);
    let mant = u32::from(bits & 0x3ff);
    let f = if exp == 0 {
        if mant == 0 {
            sign
        } else {
            // Subnormal: normalize.
            let mut exp = 127 - 15 + 1;
            let mut mant = mant;
            while mant & 0x400 == 0 {
                mant <<= 1;
                exp -= 1;
            }
            sign | ((exp as u32) << 23) | ((mant & 0x3ff) << 13)
        }
    } else if exp == 0x1f {
        sign | 0x7f80_0000 | (mant << 13)
    } else {
        sign | ((exp + 127 - 15) << 23) | (mant << 13)
    };
    f32::from_bits(f)
}

fn read_uint(bytes: &[u8], width: u32) -> Option<u64> {
    Some(match width {
        8 => u64::from(*bytes.first()?),
        16 => u64::from(u16::from_le_bytes(bytes.get(0..2)?.try_into().ok()?)),
        32 => u64::from(u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?)),
        64 => u64::from_le_bytes(bytes.get(0..8)?.try_into().ok()?),
        _ => return None,
    })
}

/// Decodes one attribute value from `bytes`, widening each component.
///
/// Returns `None` when the byte range is too short or the format is not a
/// supported combination (e.g. 8-bit floats).
pub fn decode_attribute(format: VertexFormat, bytes: &[u8]) -> Option<Vec<AttrComponent>> {
    if format.count == 0 || format.count > 4 {
        return None;
    }
    let comp_bytes = (format.width / 8) as usize;
    let mut out = Vec::with_capacity(format.count as usize);
    for c in 0..format.count as usize {
        let chunk = bytes.get(c * comp_bytes..(c + 1) * comp_bytes)?;
        let raw = read_uint(chunk, format.width)?;
        let comp = match (format.comp, format.width) {
            (CompType::Float, 16) => AttrComponent::F32(half_to_f32(raw as u16)),
            (CompType::Float, 32) => AttrComponent::F32(f32::from_bits(raw as u32)),
            (CompType::Float, 64) => AttrComponent::F64(f64::from_bits(raw)),
            (CompType::UInt, 64) => AttrComponent::U64(raw),
            (CompType::SInt, 64) => AttrComponent::I64(raw as i64),
            (CompType::UInt, _) => AttrComponent::U32(raw as u32),
            (CompType::SInt, 8) => AttrComponent::I32(i32::from(raw as u8 as i8)),
            (CompType::SInt, 16) => AttrComponent::I32(i32::from(raw as u16 as i16)),
            (CompType::SInt, 32) => AttrComponent::I32(raw as i32),
            (CompType::UNorm, w @ (8 | 16)) => {
                let max = ((1u64 << w) - 1) as f32;
                AttrComponent::F32(raw as f32 / max)
            }
            (CompType::SNorm, 8) => {
                let v = raw as u8 as i8;
                AttrComponent::F32((f32::from(v) / 127.0).max(-1.0))
            }
            (CompType::SNorm, 16) => {
                let v = raw as u16 as i16;
                AttrComponent::F32((f32::from(v) / 32767.0).max(-1.0))
            }
            _ => return None,
        };
        out.push(comp);
    }
    Some(out)
}

/// Builds a per-attribute compacted buffer: element `i` of the output is the
/// raw attribute value of source element `i`, tightly packed at
/// [`VertexFormat::byte_size`] stride.
///
/// Reads past the end of `src` compact as zeroes, matching the robust-access
/// behavior the patched shader relies on.
pub fn compact_attribute(
    src: &[u8],
    src_stride: u32,
    src_offset: u32,
    format: VertexFormat,
    element_count: u32,
) -> Vec<u8> {
    let elem = format.byte_size() as usize;
    let mut out = vec![0u8; elem * element_count as usize];
    for i in 0..element_count as usize {
        let src_at = i * src_stride as usize + src_offset as usize;
        let dst = &mut out[i * elem..(i + 1) * elem];
        if let Some(bytes) = src.get(src_at..src_at + elem) {
            dst.copy_from_slice(bytes);
        } else if let Some(avail) = src.get(src_at..) {
            dst[..avail.len()].copy_from_slice(avail);
        }
    }
    out
}

/// Reference fetch from a compacted buffer, as the rewritten shader does it.
pub fn fetch_compacted(
    compacted: &[u8],
    format: VertexFormat,
    element: u32,
) -> Option<Vec<AttrComponent>> {
    let elem = format.byte_size() as usize;
    let at = element as usize * elem;
    decode_attribute(format, compacted.get(at..at + elem)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn f32_bits(c: &AttrComponent) -> u32 {
        match c {
            AttrComponent::F32(f) => f.to_bits(),
            other => panic!("expected f32 component, got {other:?}"),
        }
    }

    #[test]
    fn half3_attribute_widens_to_f32() {
        // Scenario: R16G16B16_SFLOAT, stride 12, fetched at vertex 5 of 10.
        let values: [f32; 3] = [1.5, -0.25, 1024.0];
        let halves: [u16; 3] = [0x3e00, 0xb400, 0x6400];
        let mut src = vec![0u8; 12 * 10];
        for (i, h) in halves.iter().enumerate() {
            src[5 * 12 + i * 2..5 * 12 + i * 2 + 2].copy_from_slice(&h.to_le_bytes());
        }

        let format = VertexFormat::new(CompType::Float, 16, 3);
        assert_eq!(format.byte_size(), 6);
        let compacted = compact_attribute(&src, 12, 0, format, 10);
        let fetched = fetch_compacted(&compacted, format, 5).expect("fetches");
        for (got, want) in fetched.iter().zip(values) {
            assert_eq!(f32_bits(got), want.to_bits());
        }
    }

    #[test]
    fn integer_widening_is_sign_correct() {
        let format = VertexFormat::new(CompType::SInt, 8, 2);
        let decoded = decode_attribute(format, &[0xff, 0x7f]).unwrap();
        assert_eq!(
            decoded,
            vec![AttrComponent::I32(-1), AttrComponent::I32(127)]
        );

        let format = VertexFormat::new(CompType::UInt, 16, 1);
        let decoded = decode_attribute(format, &0xbeefu16.to_le_bytes()).unwrap();
        assert_eq!(decoded, vec![AttrComponent::U32(0xbeef)]);
    }

    #[test]
    fn double_and_long_round_trip_bit_for_bit() {
        let format = VertexFormat::new(CompType::Float, 64, 2);
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1.0f64.to_le_bytes());
        bytes.extend_from_slice(&(-2.5f64).to_le_bytes());
        let decoded = decode_attribute(format, &bytes).unwrap();
        assert_eq!(
            decoded,
            vec![AttrComponent::F64(1.0), AttrComponent::F64(-2.5)]
        );

        let format = VertexFormat::new(CompType::UInt, 64, 1);
        let decoded = decode_attribute(format, &0xdead_beef_cafe_f00du64.to_le_bytes()).unwrap();
        assert_eq!(decoded, vec![AttrComponent::U64(0xdead_beef_cafe_f00d)]);
    }

    #[test]
    fn unorm_snorm_normalization() {
        let format = VertexFormat::new(CompType::UNorm, 8, 4);
        let decoded = decode_attribute(format, &[0, 255, 128, 64]).unwrap();
        assert_eq!(f32_bits(&decoded[0]), 0.0f32.to_bits());
        assert_eq!(f32_bits(&decoded[1]), 1.0f32.to_bits());

        let format = VertexFormat::new(CompType::SNorm, 16, 1);
        let decoded = decode_attribute(format, &(i16::MIN).to_le_bytes()).unwrap();
        // -32768 clamps to -1.0 rather than overshooting.
        assert_eq!(f32_bits(&decoded[0]), (-1.0f32).to_bits());
    }

    #[test]
    fn compaction_zero_fills_out_of_range_reads() {
        let format = VertexFormat::new(CompType::Float, 32, 1);
        let src = 7.0f32.to_le_bytes();
        // Two elements requested, source holds only one.
        let compacted = compact_attribute(&src, 4, 0, format, 2);
        let first = fetch_compacted(&compacted, format, 0).unwrap();
        let second = fetch_compacted(&compacted, format, 1).unwrap();
        assert_eq!(first, vec![AttrComponent::F32(7.0)]);
        assert_eq!(second, vec![AttrComponent::F32(0.0)]);
    }

    #[test]
    fn compaction_then_fetch_round_trips_all_supported_widths() {
        let cases = [
            VertexFormat::new(CompType::Float, 32, 4),
            VertexFormat::new(CompType::Float, 16, 2),
            VertexFormat::new(CompType::UInt, 8, 4),
            VertexFormat::new(CompType::SInt, 16, 3),
            VertexFormat::new(CompType::UNorm, 8, 2),
            VertexFormat::new(CompType::SNorm, 8, 4),
            VertexFormat::new(CompType::UInt, 32, 1),
        ];
        for format in cases {
            let stride = format.byte_size() + 5; // deliberately unaligned
            let count = 7u32;
            let mut src = vec![0u8; (stride * count) as usize];
            for (i, b) in src.iter_mut().enumerate() {
                *b = (i * 31 % 251) as u8;
            }
            let compacted = compact_attribute(&src, stride, 0, format, count);
            for i in 0..count {
                let direct =
                    decode_attribute(format, &src[(i * stride) as usize..]).expect("direct");
                let via = fetch_compacted(&compacted, format, i).expect("compacted");
                assert_eq!(direct, via, "format {format:?} element {i}");
            }
        }
    }
}
