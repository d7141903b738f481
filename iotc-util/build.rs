//! Compile time configurations for the util crate
fn main() {
    // the IOTC_PKG_NAME variable is used to create local folders under
    // `~/.config` and other directories. Do not change the name unless you
    // know what you are doing as this means any previously cached
    // credentials will no longer be found by the client.
    println!("cargo::rustc-env=IOTC_PKG_NAME=iotc");
}
