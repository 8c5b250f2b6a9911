//! The C entry point.
//!
//! The compiler exports the program body as `__PascalMain`; the
//! linker finds `main` here. Output is flushed on the way out so
//! buffered text survives a program that never writes a newline.

extern "C" {
    fn __PascalMain();
}

/// # Safety
/// Called once by the C startup code.
#[cfg(not(test))]
#[no_mangle]
pub unsafe extern "C" fn main(_argc: i32, _argv: *const *const u8) -> i32 {
    __PascalMain();
    crate::file::flush_stdout();
    0
}
