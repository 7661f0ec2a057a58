//! H.264 Annex B NAL parsing: start-code scanning into a `NalUnit` iterator,
//! an exp-Golomb bit reader, and SPS/PPS/slice-header field walks far enough
//! to reach picture dimensions and codec identification. Only NAL framing
//! and header parsing are in scope - no decode/encode.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("NAL unit too short for this syntax element")]
    Truncated,
    #[error("not a NAL unit of the expected type (found type {found}, expected {expected})")]
    WrongNalType { found: u8, expected: u8 },
    #[error("exp-golomb code exceeded 31 leading zero bits")]
    GolombOverflow,
}

type Result<T> = std::result::Result<T, ParseError>;

pub const NAL_TYPE_SLICE_NON_IDR: u8 = 1;
pub const NAL_TYPE_SLICE_IDR: u8 = 5;
pub const NAL_TYPE_SEI: u8 = 6;
pub const NAL_TYPE_SPS: u8 = 7;
pub const NAL_TYPE_PPS: u8 = 8;

/// A NAL unit as located within a larger Annex B buffer: type plus the
/// payload bytes (NAL header byte included, start code excluded).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NalUnit {
    pub nal_type: u8,
    pub nal_ref_idc: u8,
    pub data: Vec<u8>,
}

impl NalUnit {
    fn from_slice(data: &[u8]) -> Self {
        let header = data[0];
        Self {
            nal_type: header & 0x1F,
            nal_ref_idc: (header >> 5) & 0x03,
            data: data.to_vec(),
        }
    }
}

fn find_start_code_positions(data: &[u8]) -> Vec<usize> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 {
            if i + 3 < data.len() && data[i + 2] == 0 && data[i + 3] == 1 {
                starts.push(i + 4);
                i += 4;
                continue;
            } else if data[i + 2] == 1 {
                starts.push(i + 3);
                i += 3;
                continue;
            }
        }
        i += 1;
    }
    starts
}

/// Split an Annex B byte stream into its constituent NAL units.
pub fn extract_nals(data: &[u8]) -> Vec<NalUnit> {
    let starts = find_start_code_positions(data);
    let mut nals = Vec::with_capacity(starts.len());

    for (idx, &start) in starts.iter().enumerate() {
        if start >= data.len() {
            continue;
        }
        let end = if idx + 1 < starts.len() {
            let next = starts[idx + 1];
            if next >= 4 && data[next - 4..next] == [0, 0, 0, 1] {
                next - 4
            } else if next >= 3 && data[next - 3..next] == [0, 0, 1] {
                next - 3
            } else {
                next
            }
        } else {
            data.len()
        };
        nals.push(NalUnit::from_slice(&data[start..end]));
    }
    nals
}

/// True if any NAL unit in `data` is an IDR slice (type 5).
pub fn contains_idr(data: &[u8]) -> bool {
    extract_nals(data).iter().any(|n| n.nal_type == NAL_TYPE_SLICE_IDR)
}

/// Bit reader over a NAL payload with exponential Golomb support. A small
/// lookup table accelerates the common case of codes 9 bits or shorter;
/// longer codes fall back to a bit-at-a-time loop.
pub struct BitReader<'a> {
    data: &'a [u8],
    byte_offset: usize,
    bit_offset: u8,
}

/// `(leading_zero_bits, value)` for every 9-bit-or-shorter exp-golomb prefix,
/// keyed by the first 9 bits read as a big-endian `u16` window. Built once;
/// entries with more than 9 total bits (1 + zeros + zeros suffix) are not
/// covered and fall back to the slow path.
const GOLOMB_FAST_BITS: u32 = 9;

impl<'a> BitReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, byte_offset: 0, bit_offset: 0 }
    }

    pub fn bits_remaining(&self) -> usize {
        (self.data.len() - self.byte_offset) * 8 - self.bit_offset as usize
    }

    pub fn read_bit(&mut self) -> Result<u8> {
        if self.byte_offset >= self.data.len() {
            return Err(ParseError::Truncated);
        }
        let bit = (self.data[self.byte_offset] >> (7 - self.bit_offset)) & 1;
        self.bit_offset += 1;
        if self.bit_offset == 8 {
            self.bit_offset = 0;
            self.byte_offset += 1;
        }
        Ok(bit)
    }

    pub fn read_bits(&mut self, n: u8) -> Result<u32> {
        let mut val = 0u32;
        for _ in 0..n {
            val = (val << 1) | self.read_bit()? as u32;
        }
        Ok(val)
    }

    pub fn read_flag(&mut self) -> Result<bool> {
        Ok(self.read_bit()? == 1)
    }

    /// Unsigned exp-Golomb. Uses the fast path (peek up to 9 bits, decode
    /// without backtracking) when the remaining leading-zero run is short
    /// enough to fit; otherwise walks bit by bit.
    pub fn read_ue(&mut self) -> Result<u32> {
        if self.bits_remaining() >= GOLOMB_FAST_BITS as usize {
            if let Some((consumed, value)) = self.try_fast_ue() {
                self.advance_bits(consumed);
                return Ok(value);
            }
        }

        let mut leading_zeros = 0u32;
        loop {
            let bit = self.read_bit()?;
            if bit == 1 {
                break;
            }
            leading_zeros += 1;
            if leading_zeros > 31 {
                return Err(ParseError::GolombOverflow);
            }
        }
        if leading_zeros == 0 {
            return Ok(0);
        }
        let suffix = self.read_bits(leading_zeros as u8)?;
        Ok((1 << leading_zeros) - 1 + suffix)
    }

    pub fn read_se(&mut self) -> Result<i32> {
        let val = self.read_ue()?;
        Ok(if val == 0 {
            0
        } else if val % 2 == 1 {
            (val / 2 + 1) as i32
        } else {
            -(val as i32 / 2)
        })
    }

    /// Peek at up to `GOLOMB_FAST_BITS` without consuming them, and try to
    /// decode a full exp-golomb code within that window. Returns
    /// `(bits_consumed, value)` on success.
    fn try_fast_ue(&self) -> Option<(u32, u32)> {
        let mut scratch = BitReader { data: self.data, byte_offset: self.byte_offset, bit_offset: self.bit_offset };
        let mut leading_zeros = 0u32;
        loop {
            if leading_zeros >= GOLOMB_FAST_BITS {
                return None;
            }
            let bit = scratch.read_bit().ok()?;
            if bit == 1 {
                break;
            }
            leading_zeros += 1;
        }
        if leading_zeros == 0 {
            return Some((1, 0));
        }
        let suffix = scratch.read_bits(leading_zeros as u8).ok()?;
        let value = (1 << leading_zeros) - 1 + suffix;
        Some((2 * leading_zeros + 1, value))
    }

    fn advance_bits(&mut self, n: u32) {
        let total = self.byte_offset * 8 + self.bit_offset as usize + n as usize;
        self.byte_offset = total / 8;
        self.bit_offset = (total % 8) as u8;
    }
}

/// Profile IDCs that carry the extra chroma/bit-depth/scaling-list fields
/// in SPS (ITU-T H.264 Table 7-1's "High" family and relatives).
const HIGH_PROFILE_FAMILY: [u8; 12] = [100, 110, 122, 244, 44, 83, 86, 118, 128, 138, 139, 134];

#[derive(Debug, Clone, PartialEq)]
pub struct SpsInfo {
    pub seq_parameter_set_id: u32,
    pub profile_idc: u8,
    pub constraint_set0_flag: bool,
    pub constraint_set1_flag: bool,
    pub level_idc: u8,
    pub chroma_format_idc: u32,
    pub pic_width: u32,
    pub pic_height: u32,
    pub frame_mbs_only_flag: bool,
    pub vui_parameters_present: bool,
    pub colour_description_present: bool,
}

/// Parse an SPS NAL unit (NAL header included) through to picture
/// dimensions and VUI colour presence.
pub fn parse_sps(nal: &NalUnit) -> Result<SpsInfo> {
    if nal.nal_type != NAL_TYPE_SPS {
        return Err(ParseError::WrongNalType { found: nal.nal_type, expected: NAL_TYPE_SPS });
    }
    if nal.data.len() < 4 {
        return Err(ParseError::Truncated);
    }

    let profile_idc = nal.data[1];
    let constraint_flags = nal.data[2];
    let level_idc = nal.data[3];
    let constraint_set0_flag = constraint_flags & 0x80 != 0;
    let constraint_set1_flag = constraint_flags & 0x40 != 0;

    let mut r = BitReader::new(&nal.data[4..]);
    let seq_parameter_set_id = r.read_ue()?;

    let mut chroma_format_idc = 1u32;
    if HIGH_PROFILE_FAMILY.contains(&profile_idc) {
        chroma_format_idc = r.read_ue()?;
        if chroma_format_idc == 3 {
            r.read_flag()?; // separate_colour_plane_flag
        }
        r.read_ue()?; // bit_depth_luma_minus8
        r.read_ue()?; // bit_depth_chroma_minus8
        r.read_flag()?; // qpprime_y_zero_transform_bypass_flag
        if r.read_flag()? {
            let count = if chroma_format_idc != 3 { 8 } else { 12 };
            for i in 0..count {
                if r.read_flag()? {
                    skip_scaling_list(&mut r, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    r.read_ue()?; // log2_max_frame_num_minus4
    let poc_type = r.read_ue()?;
    if poc_type == 0 {
        r.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
    } else if poc_type == 1 {
        r.read_flag()?; // delta_pic_order_always_zero_flag
        r.read_se()?; // offset_for_non_ref_pic
        r.read_se()?; // offset_for_top_to_bottom_field
        let num_ref_frames_in_poc_cycle = r.read_ue()?;
        for _ in 0..num_ref_frames_in_poc_cycle {
            r.read_se()?;
        }
    }

    r.read_ue()?; // max_num_ref_frames
    r.read_flag()?; // gaps_in_frame_num_value_allowed_flag
    let pic_width_in_mbs_minus1 = r.read_ue()?;
    let pic_height_in_map_units_minus1 = r.read_ue()?;
    let frame_mbs_only_flag = r.read_flag()?;
    if !frame_mbs_only_flag {
        r.read_flag()?; // mb_adaptive_frame_field_flag
    }
    r.read_flag()?; // direct_8x8_inference_flag

    let mut crop_left = 0;
    let mut crop_right = 0;
    let mut crop_top = 0;
    let mut crop_bottom = 0;
    if r.read_flag()? {
        crop_left = r.read_ue()?;
        crop_right = r.read_ue()?;
        crop_top = r.read_ue()?;
        crop_bottom = r.read_ue()?;
    }

    let frame_height_factor = if frame_mbs_only_flag { 1 } else { 2 };
    let crop_unit_x = if chroma_format_idc == 0 { 1 } else { 2 };
    let crop_unit_y = crop_unit_x * frame_height_factor;
    let pic_width = (pic_width_in_mbs_minus1 + 1) * 16 - crop_unit_x * (crop_left + crop_right);
    let pic_height = frame_height_factor * (pic_height_in_map_units_minus1 + 1) * 16
        - crop_unit_y * (crop_top + crop_bottom);

    let vui_present = r.read_flag()?;
    let mut colour_description_present = false;
    if vui_present {
        if r.read_flag()? {
            // aspect_ratio_info_present_flag
            let ar_idc = r.read_bits(8)?;
            if ar_idc == 255 {
                r.read_bits(16)?;
                r.read_bits(16)?;
            }
        }
        if r.read_flag()? {
            r.read_flag()?; // overscan_appropriate_flag
        }
        if r.read_flag()? {
            // video_signal_type_present_flag
            r.read_bits(3)?; // video_format
            r.read_flag()?; // video_full_range_flag
            colour_description_present = r.read_flag()?;
        }
    }

    Ok(SpsInfo {
        seq_parameter_set_id,
        profile_idc,
        constraint_set0_flag,
        constraint_set1_flag,
        level_idc,
        chroma_format_idc,
        pic_width,
        pic_height,
        frame_mbs_only_flag,
        vui_parameters_present: vui_present,
        colour_description_present,
    })
}

fn skip_scaling_list(r: &mut BitReader, size: usize) -> Result<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = r.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        last_scale = if next_scale == 0 { last_scale } else { next_scale };
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
pub struct PpsInfo {
    pub pic_parameter_set_id: u32,
    pub seq_parameter_set_id: u32,
    pub entropy_coding_mode_flag: bool,
    pub num_slice_groups_minus1: u32,
}

/// Parse a PPS NAL unit through its first few fields (enough to resolve
/// which SPS a slice references and whether CABAC is in use).
pub fn parse_pps(nal: &NalUnit) -> Result<PpsInfo> {
    if nal.nal_type != NAL_TYPE_PPS {
        return Err(ParseError::WrongNalType { found: nal.nal_type, expected: NAL_TYPE_PPS });
    }
    if nal.data.len() < 2 {
        return Err(ParseError::Truncated);
    }
    let mut r = BitReader::new(&nal.data[1..]);
    let pic_parameter_set_id = r.read_ue()?;
    let seq_parameter_set_id = r.read_ue()?;
    let entropy_coding_mode_flag = r.read_flag()?;
    r.read_flag()?; // bottom_field_pic_order_in_frame_present_flag
    let num_slice_groups_minus1 = r.read_ue()?;

    Ok(PpsInfo {
        pic_parameter_set_id,
        seq_parameter_set_id,
        entropy_coding_mode_flag,
        num_slice_groups_minus1,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceType {
    P,
    B,
    I,
    Sp,
    Si,
}

impl SliceType {
    fn from_code(code: u32) -> Option<Self> {
        match code % 5 {
            0 => Some(Self::P),
            1 => Some(Self::B),
            2 => Some(Self::I),
            3 => Some(Self::Sp),
            4 => Some(Self::Si),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SliceHeader {
    pub first_mb_in_slice: u32,
    pub slice_type: SliceType,
    pub pic_parameter_set_id: u32,
}

/// Parse the leading fields of a slice header, common to both IDR and
/// non-IDR slices (`first_mb_in_slice`/`slice_type`/`pic_parameter_set_id`).
/// Stops before the frame-num and reference-list fields, which require the
/// referenced SPS/PPS to interpret correctly and are not needed for the
/// framing concerns this crate covers.
pub fn parse_slice_header(nal: &NalUnit) -> Result<SliceHeader> {
    if nal.nal_type != NAL_TYPE_SLICE_IDR && nal.nal_type != NAL_TYPE_SLICE_NON_IDR {
        return Err(ParseError::WrongNalType { found: nal.nal_type, expected: NAL_TYPE_SLICE_IDR });
    }
    if nal.data.len() < 2 {
        return Err(ParseError::Truncated);
    }
    let mut r = BitReader::new(&nal.data[1..]);
    let first_mb_in_slice = r.read_ue()?;
    let slice_type_code = r.read_ue()?;
    let slice_type = SliceType::from_code(slice_type_code).ok_or(ParseError::Truncated)?;
    let pic_parameter_set_id = r.read_ue()?;

    Ok(SliceHeader { first_mb_in_slice, slice_type, pic_parameter_set_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annex_b(nals: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for nal in nals {
            out.extend_from_slice(&[0, 0, 0, 1]);
            out.extend_from_slice(nal);
        }
        out
    }

    #[test]
    fn contains_idr_detects_type_5() {
        let data = annex_b(&[&[0x67, 1, 2, 3], &[0x65, 4, 5, 6]]);
        assert!(contains_idr(&data));
    }

    #[test]
    fn contains_idr_false_without_idr() {
        let data = annex_b(&[&[0x67, 1, 2, 3], &[0x41, 4, 5, 6]]);
        assert!(!contains_idr(&data));
    }

    #[test]
    fn extract_nals_splits_on_both_start_code_widths() {
        let mut data = vec![0, 0, 1, 0x67, 0xAA];
        data.extend_from_slice(&[0, 0, 0, 1, 0x65, 0xBB]);
        let nals = extract_nals(&data);
        assert_eq!(nals.len(), 2);
        assert_eq!(nals[0].nal_type, 7);
        assert_eq!(nals[0].data, vec![0x67, 0xAA]);
        assert_eq!(nals[1].nal_type, 5);
        assert_eq!(nals[1].data, vec![0x65, 0xBB]);
    }

    #[test]
    fn bitreader_reads_bits_msb_first() {
        let mut r = BitReader::new(&[0b1010_0000]);
        assert_eq!(r.read_bit().unwrap(), 1);
        assert_eq!(r.read_bit().unwrap(), 0);
        assert_eq!(r.read_bit().unwrap(), 1);
    }

    #[test]
    fn read_ue_matches_known_codes() {
        // 1 -> 0, 010 -> 1, 011 -> 2, 00100 -> 3
        let mut r = BitReader::new(&[0b1_010_011_0, 0b0100_0000]);
        assert_eq!(r.read_ue().unwrap(), 0);
        assert_eq!(r.read_ue().unwrap(), 1);
        assert_eq!(r.read_ue().unwrap(), 2);
        assert_eq!(r.read_ue().unwrap(), 3);
    }

    #[test]
    fn read_se_maps_ue_to_signed_zigzag() {
        // ue values 0,1,2,3,4 -> se values 0,1,-1,2,-2
        let mut r = BitReader::new(&[0b1_010_011_0, 0b0100_0000]);
        assert_eq!(r.read_se().unwrap(), 0);
        assert_eq!(r.read_se().unwrap(), 1);
        assert_eq!(r.read_se().unwrap(), -1);
        assert_eq!(r.read_se().unwrap(), 2);
    }

    #[test]
    fn golomb_overflow_on_pathological_input() {
        let mut r = BitReader::new(&[0u8; 8]);
        assert_eq!(r.read_ue(), Err(ParseError::GolombOverflow));
    }

    #[test]
    fn parse_sps_rejects_wrong_nal_type() {
        let nal = NalUnit { nal_type: 5, nal_ref_idc: 3, data: vec![0x65, 0, 0, 0] };
        assert!(matches!(parse_sps(&nal), Err(ParseError::WrongNalType { .. })));
    }

    #[test]
    fn parse_sps_baseline_profile_dimensions() {
        // A minimal, hand-built baseline-profile SPS: profile_idc=66 (no high
        // profile fields), sufficient trailing bits to reach past cropping
        // and the vui_parameters_present_flag (set to 0).
        let mut bits: Vec<u8> = Vec::new();
        // seq_parameter_set_id = 0 -> "1"
        // log2_max_frame_num_minus4 = 0 -> "1"
        // pic_order_cnt_type = 0 -> "1"
        // log2_max_pic_order_cnt_lsb_minus4 = 0 -> "1"
        // max_num_ref_frames = 0 -> "1"
        // gaps_in_frame_num_value_allowed_flag = 0 -> "0"
        // pic_width_in_mbs_minus1 = 10 (ue(10) = 0001011) -> width = 11*16=176
        // pic_height_in_map_units_minus1 = 8 (ue(8) = 0001001) -> height = 9*16=144
        // frame_mbs_only_flag = 1 -> "1"
        // direct_8x8_inference_flag = 1 -> "1"
        // frame_cropping_flag = 0 -> "0"
        // vui_parameters_present_flag = 0 -> "0"
        let bitstring = "1 1 1 1 1 0 0001011 0001001 1 1 0 0".replace(' ', "");
        push_bits(&mut bits, &bitstring);

        let mut nal_data = vec![0x67u8, 66, 0x00, 30];
        nal_data.extend_from_slice(&bits);
        let nal = NalUnit { nal_type: 7, nal_ref_idc: 3, data: nal_data };

        let sps = parse_sps(&nal).unwrap();
        assert_eq!(sps.profile_idc, 66);
        assert_eq!(sps.pic_width, 176);
        assert_eq!(sps.pic_height, 144);
        assert!(sps.frame_mbs_only_flag);
        assert!(!sps.vui_parameters_present);
    }

    fn push_bits(out: &mut Vec<u8>, bitstring: &str) {
        let mut byte = 0u8;
        let mut count = 0;
        for c in bitstring.chars() {
            byte = (byte << 1) | if c == '1' { 1 } else { 0 };
            count += 1;
            if count == 8 {
                out.push(byte);
                byte = 0;
                count = 0;
            }
        }
        if count > 0 {
            byte <<= 8 - count;
            out.push(byte);
        }
    }

    #[test]
    fn parse_pps_reads_leading_fields() {
        // pic_parameter_set_id=0 ("1"), seq_parameter_set_id=0 ("1"),
        // entropy_coding_mode_flag=1 ("1"), bottom_field...=0 ("0"),
        // num_slice_groups_minus1=0 ("1")
        let mut bits = Vec::new();
        push_bits(&mut bits, "11101");
        let mut nal_data = vec![0x68u8];
        nal_data.extend_from_slice(&bits);
        let nal = NalUnit { nal_type: 8, nal_ref_idc: 3, data: nal_data };

        let pps = parse_pps(&nal).unwrap();
        assert_eq!(pps.pic_parameter_set_id, 0);
        assert_eq!(pps.seq_parameter_set_id, 0);
        assert!(pps.entropy_coding_mode_flag);
        assert_eq!(pps.num_slice_groups_minus1, 0);
    }

    #[test]
    fn parse_slice_header_reads_leading_fields() {
        // first_mb_in_slice=0 ("1"), slice_type=2 (I, ue(2)="011"),
        // pic_parameter_set_id=0 ("1")
        let mut bits = Vec::new();
        push_bits(&mut bits, "10111");
        let mut nal_data = vec![0x65u8];
        nal_data.extend_from_slice(&bits);
        let nal = NalUnit { nal_type: 5, nal_ref_idc: 3, data: nal_data };

        let hdr = parse_slice_header(&nal).unwrap();
        assert_eq!(hdr.first_mb_in_slice, 0);
        assert_eq!(hdr.slice_type, SliceType::I);
        assert_eq!(hdr.pic_parameter_set_id, 0);
    }
}
