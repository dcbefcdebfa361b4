use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser as ClapParser;

use codegen::Mode;
use diag::{Diag, DiagKind};
use pp::Preprocessor;

#[derive(ClapParser, Debug)]
#[command(
    name = "rtmcc",
    about = "RT-Micro-C compiler: .rtmc source to .vmb bytecode",
    version
)]
struct Cli {
    /// Input source file (.rtmc)
    input: PathBuf,
    /// Output image path (default: input with .vmb extension)
    #[arg(short = 'o', long = "output")]
    output: Option<PathBuf>,
    /// Strip debug info (line table, symbol names, comments)
    #[arg(long)]
    release: bool,
    /// Report per-pass progress on stderr
    #[arg(long)]
    verbose: bool,
    /// Stop after parsing and print the AST
    #[arg(long)]
    ast: bool,
    /// Stop after lexing and print the token stream
    #[arg(long)]
    tokens: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(diag) => {
            eprintln!("{}", diag);
            ExitCode::from(exit_code_for(diag.kind))
        }
    }
}

/// Exit codes are per failing pass: 1 preprocessor, 2 lexer, 3 parser,
/// 4 analyzer, 5 codegen, 6 I/O.
fn exit_code_for(kind: DiagKind) -> u8 {
    use DiagKind::*;
    match kind {
        IncludeNotFound | CyclicMacro | MalformedDirective => 1,
        LexUnterminatedLiteral | LexBadNumber | LexBadChar => 2,
        ParseUnexpectedToken => 3,
        UndefinedSymbol | DuplicateDefinition | TypeMismatch | FieldNotFound | ConstAssignment
        | NonLValueAssignment | BadBitFieldWidth | CircularType | ArraySizeNotConstant
        | ArityMismatch => 4,
        CodegenBranchTooFar => 5,
        Io => 6,
    }
}

fn run(cli: &Cli) -> Result<(), Diag> {
    let input_name = cli.input.display().to_string();
    let in_file = |d: Diag| d.with_file(input_name.clone());

    let mut pp = Preprocessor::new();
    let text = pp.preprocess_file(&cli.input)?;
    if cli.verbose {
        eprintln!("[rtmcc] preprocessed {} bytes", text.len());
    }

    let tokens = lex::lex(&text).map_err(in_file)?;
    if cli.verbose {
        eprintln!("[rtmcc] lexed {} tokens", tokens.len());
    }
    if cli.tokens {
        for t in &tokens {
            println!("{:?} @ {}:{}", t.kind, t.span.line, t.span.col);
        }
        return Ok(());
    }

    let program = parse::parse_program(tokens).map_err(in_file)?;
    if cli.verbose {
        eprintln!(
            "[rtmcc] parsed {} records, {} channels, {} globals, {} functions",
            program.records.len(),
            program.messages.len(),
            program.globals.len(),
            program.functions.len()
        );
    }

    let analysis = sema::analyze(&program).map_err(in_file)?;
    if cli.ast {
        println!("{:#?}", program);
        return Ok(());
    }

    let folded = sema::fold::fold_program(program);
    let mode = if cli.release {
        Mode::Release
    } else {
        Mode::Debug
    };
    let image = codegen::generate(&folded, &analysis, mode).map_err(in_file)?;
    if cli.verbose {
        eprintln!(
            "[rtmcc] generated {} instructions, {} constants, {} strings",
            image.instructions.len(),
            image.constants.len(),
            image.strings.len()
        );
        eprint!("{}", codegen::disassemble(&image));
    }

    let bytes = vmb::write_image(&image)
        .map_err(|e| Diag::new(DiagKind::Io, 0, 0, e.to_string()))?;
    let out_path = cli
        .output
        .clone()
        .unwrap_or_else(|| cli.input.with_extension("vmb"));
    fs::write(&out_path, &bytes).map_err(|e| {
        Diag::new(
            DiagKind::Io,
            0,
            0,
            format!("failed to write {}: {}", out_path.display(), e),
        )
    })?;
    if cli.verbose {
        eprintln!("[rtmcc] wrote {} ({} bytes)", out_path.display(), bytes.len());
    }
    Ok(())
}
