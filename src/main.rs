use std::fs;
use std::io::{self, BufWriter, Read, Write};
use std::process;

use clap::Parser;

use cc0::{binary, compile_source, listing, tokenize_source, vm};

#[derive(Parser)]
#[command(name = "cc0", version, about = "C0 compiler and stack virtual machine")]
struct Cli {
    /// Input C0 source file ('-' reads stdin)
    input: String,
    /// Emit the token listing as text
    #[arg(short = 't', conflicts_with_all = ["assemble", "compile", "run"])]
    tokenize: bool,
    /// Emit the assembly-style listing as text
    #[arg(short = 's', conflicts_with_all = ["compile", "run"])]
    assemble: bool,
    /// Compile to a bytecode binary
    #[arg(short = 'c')]
    compile: bool,
    /// Compile to a bytecode binary, then execute it (implies -c)
    #[arg(short = 'r')]
    run: bool,
    /// Output path ('-' writes stdout)
    #[arg(short = 'o', long = "output", default_value = "out")]
    output: String,
}

fn main() {
    let cli = Cli::parse();
    if !(cli.tokenize || cli.assemble || cli.compile || cli.run) {
        eprintln!("error: choose one of -t, -s, -c or -r");
        process::exit(2);
    }

    let (filename, source) = read_source(&cli.input);

    if cli.tokenize {
        let tokens = match tokenize_source(&source) {
            Ok(tokens) => tokens,
            Err(diag) => {
                diag.render(&filename, &source);
                process::exit(2);
            }
        };
        let mut out = open_output(&cli.output);
        if let Err(e) = listing::write_tokens(&source, &tokens, &mut out) {
            fail_write(&cli.output, e);
        }
        return;
    }

    let program = match compile_source(&source) {
        Ok(program) => program,
        Err(diag) => {
            diag.render(&filename, &source);
            process::exit(2);
        }
    };

    if cli.assemble {
        let mut out = open_output(&cli.output);
        if let Err(e) = listing::write_program(&program, &mut out) {
            fail_write(&cli.output, e);
        }
        return;
    }

    // -c / -r: write the binary, and for -r run what was written.
    let bytes = binary::encode(&program);
    if cli.output == "-" {
        if let Err(e) = io::stdout().lock().write_all(&bytes) {
            fail_write(&cli.output, e);
        }
    } else if let Err(e) = fs::write(&cli.output, &bytes) {
        fail_write(&cli.output, e);
    }

    if cli.run {
        let program = match binary::decode(&bytes) {
            Ok(program) => program,
            Err(e) => {
                eprintln!("error: produced binary does not decode: {}", e);
                process::exit(2);
            }
        };
        let stdin = io::stdin().lock();
        let stdout = BufWriter::new(io::stdout().lock());
        if let Err(fault) = vm::execute(&program, stdin, stdout) {
            eprintln!("runtime error: {}", fault);
            process::exit(2);
        }
    }
}

fn read_source(path: &str) -> (String, String) {
    if path == "-" {
        let mut source = String::new();
        if let Err(e) = io::stdin().read_to_string(&mut source) {
            eprintln!("error: cannot read stdin: {}", e);
            process::exit(2);
        }
        ("<stdin>".to_string(), source)
    } else {
        match fs::read_to_string(path) {
            Ok(source) => (path.to_string(), source),
            Err(e) => {
                eprintln!("error: cannot read '{}': {}", path, e);
                process::exit(2);
            }
        }
    }
}

fn open_output(path: &str) -> Box<dyn Write> {
    if path == "-" {
        Box::new(BufWriter::new(io::stdout().lock()))
    } else {
        match fs::File::create(path) {
            Ok(file) => Box::new(BufWriter::new(file)),
            Err(e) => {
                eprintln!("error: cannot open '{}' for writing: {}", path, e);
                process::exit(2);
            }
        }
    }
}

fn fail_write(path: &str, e: io::Error) -> ! {
    eprintln!("error: cannot write '{}': {}", path, e);
    process::exit(2);
}
