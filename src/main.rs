use csv_dedupe::error::PipelineError;

fn main() {
    if let Err(err) = csv_dedupe::run() {
        eprintln!("error: {err}");
        if let Some(pipeline_err) = err.chain().find_map(|e| e.downcast_ref::<PipelineError>()) {
            eprintln!("hint: {}", pipeline_err.hint());
        }
        std::process::exit(1);
    }
}
