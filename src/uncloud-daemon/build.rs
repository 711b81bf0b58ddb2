fn main() -> Result<(), Box<dyn std::error::Error>> {
	if std::env::var_os("PROTOC").is_none() {
		std::env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
	}
	tonic_build::compile_protos("proto/control.proto")?;
	Ok(())
}
