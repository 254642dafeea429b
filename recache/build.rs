fn main() {
    // Generate the default 'cargo:' instruction output
    vergen::EmitBuilder::builder()
        .all_cargo()
        .emit()
        .expect("vergen failed");
}
