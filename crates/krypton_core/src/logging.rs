/// Print the startup banner.
pub fn splash() {
    println!(
        "krypton {} — game server node daemon",
        env!("CARGO_PKG_VERSION")
    );
}
