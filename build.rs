use std::env;
use std::fs;
use std::io::Write;
use std::path::Path;

fn main() {
    // Prepare OUT_DIR/proto directory
    let out_dir = Path::new(&env::var("OUT_DIR").unwrap()).join("proto");
    fs::create_dir_all(&out_dir).expect("Failed to create $OUT_DIR/proto directory");

    protobuf_codegen_pure::Codegen::new()
        .out_dir(&out_dir)
        .inputs(&[
            "protos/Mumble.proto",
            "protos/MumbleUDP.proto",
            "protos/Freeze.proto",
        ])
        .includes(&["protos"])
        .customize(protobuf_codegen_pure::Customize {
            generate_accessors: Some(true),
            ..Default::default()
        })
        .run()
        .expect("protoc");

    // Create mod.rs (see https://github.com/stepancheg/rust-protobuf/issues/324)
    //
    // The control-channel messages are re-exported flat; the datagram-channel
    // messages get the UDP suffix so they don't clash with their control-channel
    // namesakes (Ping, Version).
    let content = "mod Mumble;\n\
                   pub use self::Mumble::*;\n\
                   mod MumbleUDP;\n\
                   pub use self::MumbleUDP::{Audio as AudioUDP, Ping as PingUDP};\n\
                   mod Freeze;\n\
                   pub use self::Freeze::*;\n";
    let mut file = fs::File::create(out_dir.join("mod.rs")).unwrap();
    file.write_all(content.as_bytes())
        .expect("Failed to write proto/mod.rs");

    println!("cargo:rerun-if-changed=protos/Mumble.proto");
    println!("cargo:rerun-if-changed=protos/MumbleUDP.proto");
    println!("cargo:rerun-if-changed=protos/Freeze.proto");
}
