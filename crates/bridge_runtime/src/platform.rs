/// ABI name of the running binary, using Android's naming where one exists.
pub fn abi_name() -> &'static str {
    if cfg!(target_arch = "arm") {
        "armeabi-v7a"
    } else if cfg!(target_arch = "aarch64") {
        "arm64-v8a"
    } else if cfg!(target_arch = "x86") {
        "x86"
    } else if cfg!(target_arch = "x86_64") {
        "x86_64"
    } else {
        std::env::consts::ARCH
    }
}
