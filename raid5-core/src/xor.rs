// vim: tw=80
//! The engine's one XOR capability.
//!
//! Everything that computes, updates, checks, or reconstructs parity goes
//! through these two functions, so nothing else in the engine ever branches
//! on architecture.  The implementation is portable: whole words through the
//! body of the buffer, bytes at the tail.

const WORD: usize = std::mem::size_of::<u64>();

/// XOR `src` into `dst`.  The buffers must be the same length.
pub fn xor_into(dst: &mut [u8], src: &[u8]) {
    debug_assert_eq!(dst.len(), src.len());
    let split = dst.len() - dst.len() % WORD;
    let (dhead, dtail) = dst.split_at_mut(split);
    let (shead, stail) = src.split_at(split);
    for (d, s) in dhead.chunks_exact_mut(WORD).zip(shead.chunks_exact(WORD)) {
        let x = u64::from_ne_bytes((&d[..]).try_into().unwrap()) ^
                u64::from_ne_bytes((&s[..]).try_into().unwrap());
        d.copy_from_slice(&x.to_ne_bytes());
    }
    for (d, s) in dtail.iter_mut().zip(stail.iter()) {
        *d ^= *s;
    }
}

/// XOR every one of `srcs` into `dst`.
pub fn xor_buffers(dst: &mut [u8], srcs: &[&[u8]]) {
    for src in srcs {
        xor_into(dst, src);
    }
}

// LCOV_EXCL_STOP
