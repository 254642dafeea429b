fn main() {
    // Generate the default 'cargo:' instruction output.
    //
    // Git metadata isn't available when publishing the crate, or when it's being compiled
    // from crates.io by `cargo install`, so don't fail if it's not available
    vergen::EmitBuilder::builder()
        .all_cargo()
        .emit()
        .expect("vergen failed");
}
