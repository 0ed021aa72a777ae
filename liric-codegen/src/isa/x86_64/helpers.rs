//! Floating-point helper trampolines (spec §4.6).
//!
//! This backend's encoder never emits an SSE instruction. Every
//! `fadd`/`fcmp`/`sitofp`/... lowers to a `movabs r10, <addr>; call
//! r10` against one of the `*_bits` functions below, all of which
//! take and return plain `u64` bit patterns — the float math happens
//! inside real, rustc-compiled Rust, so the argument/return value
//! never needs to leave a general-purpose register at the call site.
//!
//! The one place a float value genuinely must reach `xmm0` is calling
//! into a real external C function that expects one. `to_xmm`/
//! `from_xmm` bridge that boundary: they're ordinary `extern "C" fn(u64)
//! -> f64` / `fn(f64) -> u64` trampolines, so rustc's own codegen of
//! *their* bodies does the GPR↔XMM move for us — the hand-written
//! encoder still only ever has to set up an integer argument and read
//! an integer (or, immediately after calling `to_xmm`, rely on the
//! value already sitting in `xmm0` for the next call) result.
use crate::ir::FCmpPredicate;

#[no_mangle]
pub extern "C" fn liric_helper_fadd_bits(a: u64, b: u64) -> u64 {
    (f64::from_bits(a) + f64::from_bits(b)).to_bits()
}
#[no_mangle]
pub extern "C" fn liric_helper_fsub_bits(a: u64, b: u64) -> u64 {
    (f64::from_bits(a) - f64::from_bits(b)).to_bits()
}
#[no_mangle]
pub extern "C" fn liric_helper_fmul_bits(a: u64, b: u64) -> u64 {
    (f64::from_bits(a) * f64::from_bits(b)).to_bits()
}
#[no_mangle]
pub extern "C" fn liric_helper_fdiv_bits(a: u64, b: u64) -> u64 {
    (f64::from_bits(a) / f64::from_bits(b)).to_bits()
}
#[no_mangle]
pub extern "C" fn liric_helper_fneg_bits(a: u64) -> u64 {
    (-f64::from_bits(a)).to_bits()
}
#[no_mangle]
pub extern "C" fn liric_helper_fcmp_bits(a: u64, b: u64, predicate: u64) -> u64 {
    let pred = decode_fcmp_predicate(predicate as u32);
    pred.eval_f64(f64::from_bits(a), f64::from_bits(b)) as u64
}
#[no_mangle]
pub extern "C" fn liric_helper_sitofp_bits(a: i64) -> u64 {
    (a as f64).to_bits()
}
#[no_mangle]
pub extern "C" fn liric_helper_uitofp_bits(a: u64) -> u64 {
    (a as f64).to_bits()
}
#[no_mangle]
pub extern "C" fn liric_helper_fptosi_bits(a: u64) -> i64 {
    f64::from_bits(a) as i64
}
#[no_mangle]
pub extern "C" fn liric_helper_fptoui_bits(a: u64) -> u64 {
    f64::from_bits(a) as u64
}

/// Bridge a bit pattern held in a GPR into `xmm0` via a real `f64`
/// return, right before a call into an `external_abi` function that
/// takes a float argument.
#[no_mangle]
pub extern "C" fn liric_helper_to_xmm(bits: u64) -> f64 {
    f64::from_bits(bits)
}

/// The inverse: an `external_abi` call's `f64` return, which the
/// System V ABI leaves in `xmm0`, rebitcast to a `u64` so it can go
/// straight back into a stack slot like any other value.
#[no_mangle]
pub extern "C" fn liric_helper_from_xmm(v: f64) -> u64 {
    v.to_bits()
}

pub fn fcmp_predicate_code(p: FCmpPredicate) -> u32 {
    use FCmpPredicate::*;
    match p {
        Oeq => 0,
        One => 1,
        Olt => 2,
        Ole => 3,
        Ogt => 4,
        Oge => 5,
        Ord => 6,
        Ueq => 7,
        Une => 8,
        Ult => 9,
        Ule => 10,
        Ugt => 11,
        Uge => 12,
        Uno => 13,
    }
}

fn decode_fcmp_predicate(code: u32) -> FCmpPredicate {
    use FCmpPredicate::*;
    match code {
        0 => Oeq,
        1 => One,
        2 => Olt,
        3 => Ole,
        4 => Ogt,
        5 => Oge,
        6 => Ord,
        7 => Ueq,
        8 => Une,
        9 => Ult,
        10 => Ule,
        11 => Ugt,
        12 => Uge,
        _ => Uno,
    }
}
