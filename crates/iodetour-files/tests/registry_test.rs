use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

use iodetour_files::{
    Binding, Classifier, ClassifierRoots, FileFlags, FileRegistry, RegistryConfig,
};
use iodetour_ipc::{access_to_char, Access, MountedPath, Options};

fn build_registry() -> FileRegistry {
    let classifier = Classifier::new(&ClassifierRoots {
        system: vec![r"C:\Windows".into(), r"C:\Windows\System32".into()],
        temp: vec![r"C:\Temp".into()],
        stdio: vec![],
    });
    FileRegistry::new(RegistryConfig {
        mounts: vec![MountedPath::new(r"B:\", r"C:\build")],
        classifier,
    })
    .with_current_dir(|| Some(r"C:\build".to_string()))
}

fn dump_text(reg: &FileRegistry, options: Options) -> String {
    let mut out = Vec::new();
    for line in reg.dump_lines(options) {
        line.write_to(&mut out).unwrap();
    }
    String::from_utf8(out).unwrap()
}

#[test]
fn test_read_and_write_through_handles() {
    let reg = build_registry();

    let input = reg.find_or_create("in.txt");
    reg.remember_file(0x10, input);
    reg.set_read(0x10, 128);
    reg.forget(0x10);

    let output = reg.find_or_create("out.txt");
    reg.remember_file(0x14, output);
    reg.set_write(0x14, 64);
    reg.forget(0x14);

    assert_eq!(
        dump_text(&reg, Options::empty()),
        "1C:\\build\\in.txt\n2C:\\build\\out.txt\n"
    );
}

#[test]
fn test_remember_is_idempotent() {
    let reg = build_registry();
    let info = reg.find_or_create("a.obj");

    reg.remember_file(0x20, Arc::clone(&info));
    let once = (reg.file_count(), reg.recall(0x20).map(|f| f.index()));
    reg.remember_file(0x20, Arc::clone(&info));
    let twice = (reg.file_count(), reg.recall(0x20).map(|f| f.index()));

    assert_eq!(once, twice);
    assert_eq!(reg.forget(0x20), Some(Binding::File(info)));
    assert!(reg.forget(0x20).is_none());
}

#[test]
fn test_flags_never_drop() {
    let reg = build_registry();
    let info = reg.note_read("lib.h");
    reg.remember_file(1, Arc::clone(&info));
    reg.set_write(1, 1);
    reg.note_delete("lib.h");
    reg.note_directory("lib.h");
    reg.forget(1);
    reg.duplicate(2, 1);
    reg.set_read(2, 1);

    for flag in [FileFlags::READ, FileFlags::WRITE, FileFlags::CLEANUP, FileFlags::DIRECTORY] {
        assert!(info.has(flag), "{flag:?} was cleared");
    }
}

#[test]
fn test_cant_read_corrected_once_on_close() {
    let reg = build_registry();
    let info = reg.note_open_failed("locked.db", true, true);
    assert!(info.has(FileFlags::CANT_READ | FileFlags::CANT_WRITE));

    reg.remember_file(3, Arc::clone(&info));
    reg.set_read(3, 10);
    let binding = reg.forget(3).unwrap();
    assert!(info.has(FileFlags::CANT_READ));
    reg.closed(&binding);

    assert!(!info.has(FileFlags::CANT_READ));
    assert!(info.has(FileFlags::CANT_WRITE));
}

#[test]
fn test_every_touched_path_dumped_once() {
    let reg = build_registry();
    reg.note_read("a.c");
    reg.note_read("A.C");
    reg.note_write("a.c");
    reg.note_execute(r"C:\tools\cl.exe");
    reg.note_read(r"C:\tools\cl.exe");
    reg.note_delete("old.pdb");
    reg.note_write(r"B:\out\a.obj");

    let lines = reg.dump_lines(Options::empty());
    let paths: HashSet<_> = lines.iter().map(|l| l.path.as_str()).collect();
    assert_eq!(lines.len(), 4);
    assert_eq!(paths.len(), 4);

    for (line, info) in lines.iter().zip(reg.files()) {
        assert_eq!(line.path, info.real_path());
        let flags = info.flags();
        let expected = access_to_char(Access::new(
            flags.contains(FileFlags::READ),
            flags.contains(FileFlags::WRITE),
            flags.contains(FileFlags::EXECUTE),
        ));
        assert_eq!(line.access_char(), expected);
    }
    let text = dump_text(&reg, Options::empty());
    assert!(text.contains("3C:\\build\\a.c\n"));
    assert!(text.contains("5C:\\tools\\cl.exe\n"));
    assert!(text.contains("0C:\\build\\old.pdb\n"));
    assert!(text.contains("2C:\\build\\out\\a.obj\n"));
}

#[test]
fn test_ignore_system_removes_only_system_entries() {
    let reg = build_registry();
    reg.note_read(r"C:\Windows\System32\kernel32.dll");
    reg.note_read(r"C:\windows\Fonts\arial.ttf");
    reg.note_read(r"C:\build\main.c");
    reg.note_write(r"C:\Temp\x.tmp");
    reg.note_directory(r"C:\build\obj");

    let all = reg.dump_lines(Options::empty());
    let filtered = reg.dump_lines(Options::IGNORE_SYSTEM);

    let expected: Vec<_> = all
        .iter()
        .filter(|l| !reg.lookup(&l.path).unwrap().has(FileFlags::SYSTEM_PATH))
        .cloned()
        .collect();
    assert_eq!(filtered, expected);
    assert_eq!(all.len() - filtered.len(), 2);
}

#[test]
fn test_temporary_paths_follow_ignore_option() {
    let reg = build_registry();
    reg.note_write(r"C:\Temp\cl_1234.rsp");
    reg.note_read(r"C:\build\main.c");

    let kept = dump_text(&reg, Options::empty());
    assert!(kept.contains(r"C:\Temp\cl_1234.rsp"));

    let dropped = dump_text(&reg, Options::IGNORE_TEMPORARY);
    assert!(!dropped.contains(r"C:\Temp"));
    assert!(dropped.contains(r"C:\build\main.c"));
}

#[test]
fn test_mounted_input_reports_real_path() {
    let reg = build_registry();
    let info = reg.note_read(r"b:\src\x.c");
    assert_eq!(info.input_path(), r"b:\src\x.c");
    assert_eq!(
        dump_text(&reg, Options::empty()),
        "1C:\\build\\src\\x.c\n"
    );
}

#[test]
fn test_concurrent_first_insertion() {
    const THREADS: usize = 16;
    const PATHS: usize = 64;

    let reg = Arc::new(build_registry());
    let barrier = Arc::new(Barrier::new(THREADS));
    let mut handles = Vec::new();

    for t in 0..THREADS {
        let reg = Arc::clone(&reg);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for i in 0..PATHS {
                let info = reg.find_or_create(&format!(r"src\file{i}.c"));
                reg.remember_file(t * PATHS + i, Arc::clone(&info));
                reg.set_read(t * PATHS + i, 1);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(reg.file_count(), PATHS);
    let indices: HashSet<_> = reg.files().iter().map(|f| f.index()).collect();
    assert_eq!(indices.len(), PATHS);
    for info in reg.files() {
        assert_eq!(info.bytes_read(), THREADS as u64);
    }
}
