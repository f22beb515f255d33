//! Floating-point classification and RISC-V-saturating integer conversions.
//!
//! `fcvt.*` saturates on overflow and maps NaN to the maximum representable
//! value of the target type, per the RISC-V specification. This is a
//! deliberate deviation from naive `llrint`-style truncation: out-of-range
//! inputs must clamp rather than produce an implementation-defined result.

pub fn f32_classify(value: f32) -> u64 {
    let bits = value.to_bits();
    let sign = bits >> 31 != 0;
    let exp = (bits >> 23) & 0xff;
    let mantissa = bits & 0x7f_ffff;

    classify(sign, exp == 0, exp == 0xff, mantissa == 0, mantissa, 1 << 22)
}

pub fn f64_classify(value: f64) -> u64 {
    let bits = value.to_bits();
    let sign = bits >> 63 != 0;
    let exp = (bits >> 52) & 0x7ff;
    let mantissa = bits & 0xf_ffff_ffff_ffff;

    classify(
        sign,
        exp == 0,
        exp == 0x7ff,
        mantissa == 0,
        mantissa,
        1 << 51,
    )
}

fn classify(
    sign: bool,
    exp_zero: bool,
    exp_max: bool,
    mantissa_zero: bool,
    mantissa: u64,
    quiet_bit: u64,
) -> u64 {
    if exp_max {
        if mantissa_zero {
            return if sign { 1 << 0 } else { 1 << 7 }; // -inf / +inf
        }
        return if mantissa & quiet_bit != 0 {
            1 << 9 // quiet NaN
        } else {
            1 << 8 // signalling NaN
        };
    }
    if exp_zero {
        if mantissa_zero {
            return if sign { 1 << 3 } else { 1 << 4 }; // -0 / +0
        }
        return if sign { 1 << 2 } else { 1 << 5 }; // subnormal
    }
    if sign { 1 << 1 } else { 1 << 6 } // normal
}

macro_rules! saturating_cvt {
    ($name:ident, $float:ty, $int:ty) => {
        pub fn $name(value: $float) -> $int {
            if value.is_nan() {
                return <$int>::MAX;
            }
            let rounded = value.round_ties_even();
            if rounded >= <$int>::MAX as $float {
                <$int>::MAX
            } else if rounded <= <$int>::MIN as $float {
                <$int>::MIN
            } else {
                rounded as $int
            }
        }
    };
}

macro_rules! saturating_cvt_unsigned {
    ($name:ident, $float:ty, $uint:ty) => {
        pub fn $name(value: $float) -> $uint {
            if value.is_nan() {
                return <$uint>::MAX;
            }
            let rounded = value.round_ties_even();
            if rounded <= 0.0 {
                0
            } else if rounded >= <$uint>::MAX as $float {
                <$uint>::MAX
            } else {
                rounded as $uint
            }
        }
    };
}

saturating_cvt!(f32_to_i32_saturating, f32, i32);
saturating_cvt!(f32_to_i64_saturating, f32, i64);
saturating_cvt!(f64_to_i32_saturating, f64, i32);
saturating_cvt!(f64_to_i64_saturating, f64, i64);

saturating_cvt_unsigned!(f32_to_u32_saturating, f32, u32);
saturating_cvt_unsigned!(f32_to_u64_saturating, f32, u64);
saturating_cvt_unsigned!(f64_to_u32_saturating, f64, u32);
saturating_cvt_unsigned!(f64_to_u64_saturating, f64, u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_zero_and_infinity() {
        assert_eq!(f32_classify(0.0), 1 << 4);
        assert_eq!(f32_classify(-0.0), 1 << 3);
        assert_eq!(f64_classify(f64::INFINITY), 1 << 7);
        assert_eq!(f64_classify(f64::NEG_INFINITY), 1 << 0);
    }

    #[test]
    fn classifies_nan_kinds() {
        let quiet = f32::from_bits(0x7fc0_0000);
        assert_eq!(f32_classify(quiet), 1 << 9);
        let signalling = f32::from_bits(0x7f80_0001);
        assert_eq!(f32_classify(signalling), 1 << 8);
    }

    #[test]
    fn nan_saturates_to_max_signed() {
        assert_eq!(f32_to_i64_saturating(f32::NAN), i64::MAX);
    }

    #[test]
    fn out_of_range_saturates() {
        assert_eq!(f64_to_i32_saturating(1e30), i32::MAX);
        assert_eq!(f64_to_i32_saturating(-1e30), i32::MIN);
        assert_eq!(f64_to_u32_saturating(-5.0), 0);
    }

    #[test]
    fn in_range_rounds_to_nearest_even() {
        assert_eq!(f64_to_i64_saturating(2.5), 2);
        assert_eq!(f64_to_i64_saturating(3.5), 4);
    }
}
