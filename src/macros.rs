/// Executes a libc call and turns a `-1` return into `io::Result::Err`.
///
/// Mirrors the common pattern used by every low-level syscall wrapper in
/// this crate: make the call, check the one sentinel value the kernel uses
/// to signal failure, and convert `errno` into a proper `io::Error`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}
