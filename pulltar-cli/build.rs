use vergen::EmitBuilder;

fn main() {
    // Generate the 'cargo:' instructions that bake build metadata into the binary, for the long
    // form of `--version`
    EmitBuilder::builder().all_cargo().emit().unwrap();
}
