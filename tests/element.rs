use std::cell::{Cell, RefCell};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::rc::Rc;

use evio::element::{
    decode, encode, ByteArrayCollector, Collector, CollectorQueue, DelimitedCollector,
    FactoryCollector, FactoryInput, FileCollector, FileInput, Input, InputQueue,
    KeepingCollectorQueue, MockTransport, StringCollector, StringInput, StructCollector,
};

fn until_done(mut step: impl FnMut() -> evio::element::Progress) {
    for _ in 0..1_000_000 {
        if step().done {
            return;
        }
    }
    panic!("element never finished");
}

fn boxed(data: &str) -> Box<dyn Input> {
    Box::new(StringInput::new(data.as_bytes().to_vec()))
}

fn run_input(input: &mut dyn Input, sink: &MockTransport) {
    until_done(|| input.tick(sink).expect("tick"));
}

#[test]
fn string_input_sends_everything() {
    let mock = MockTransport::new();
    let mut input = StringInput::new(&b"abcdefghijklmnopqrstuvwxyz"[..]);
    run_input(&mut input, &mock);
    assert_eq!(&mock.output()[..], b"abcdefghijklmnopqrstuvwxyz");
}

// Inputs form a monoid under concatenation: associativity at the level of
// produced bytes, with the empty queue as identity.
#[test]
fn input_concatenation_is_associative() {
    let left = {
        let mock = MockTransport::new();
        let mut input = (boxed("aa") + boxed("bb")) + boxed("cc");
        run_input(&mut *input, &mock);
        mock.output()
    };
    let right = {
        let mock = MockTransport::new();
        let mut input = boxed("aa") + (boxed("bb") + boxed("cc"));
        run_input(&mut *input, &mock);
        mock.output()
    };
    assert_eq!(left, right);
    assert_eq!(&left[..], b"aabbcc");
}

#[test]
fn empty_queue_is_input_identity() {
    for (label, mut input) in [
        ("left", Box::new(InputQueue::new()) as Box<dyn Input> + boxed("xy")),
        ("right", boxed("xy") + Box::new(InputQueue::new())),
    ] {
        let mock = MockTransport::new();
        run_input(&mut *input, &mock);
        assert_eq!(&mock.output()[..], b"xy", "{} identity", label);
    }
}

#[test]
fn factory_input_exhausts_iterator() {
    let mock = MockTransport::new();
    let mut input = FactoryInput::from_iter(vec![boxed("aaaaa"), boxed("bbbbb"), boxed("ccccc")]);
    run_input(&mut input, &mock);
    assert_eq!(&mock.output()[..], b"aaaaabbbbbccccc");

    // Depleted: further ticks report done without sending.
    let progress = input.tick(&mock).expect("tick after done");
    assert!(progress.done);
    assert_eq!(progress.bytes, 0);
}

#[test]
fn file_input_round_trips_and_respects_closing() {
    let mut src = tempfile::NamedTempFile::new().expect("tempfile");
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
    src.write_all(&payload).expect("writing payload");
    src.flush().expect("flushing");

    let mock = MockTransport::new();
    let mut input = FileInput::from_path(src.path()).expect("opening input");
    assert_eq!(input.length(), Some(payload.len() as u64));
    run_input(&mut input, &mock);
    assert_eq!(&mock.output()[..], &payload[..]);

    // closing=false keeps the handle alive through close().
    let file = fs::File::open(src.path()).expect("reopening");
    let mut keeper = FileInput::new(file, None, 4096, false);
    keeper.close();
    assert!(keeper.into_file().is_some());
}

// S3 (scaled): a file streamed through an autoflushing FileCollector keeps
// the destination size equal to the running consumed-byte counter at every
// step, and the final contents match the source.
#[test]
fn split_file_transfer_tracks_size() {
    let mut src = tempfile::NamedTempFile::new().expect("src tempfile");
    let payload = vec![b'a'; 300_000];
    src.write_all(&payload).expect("writing payload");
    src.flush().expect("flushing");

    let dst = tempfile::NamedTempFile::new().expect("dst tempfile");
    let dst_path = dst.path().to_path_buf();
    let dst_file = dst.reopen().expect("reopening dst");

    let mock = MockTransport::new();
    let mut input = FileInput::from_path(src.path()).expect("opening input");
    let mut collector = FileCollector::new(dst_file, true, true);

    let mut consumed = 0u64;
    loop {
        let produced = input.tick(&mock).expect("tick");
        let progress = collector
            .add_data(&mock, produced.bytes.max(1))
            .expect("collect");
        consumed += progress.bytes as u64;
        assert_eq!(
            fs::metadata(&dst_path).expect("stat dst").len(),
            consumed,
            "destination size must track the consumed counter"
        );
        if produced.done && mock.remaining_input().is_empty() {
            break;
        }
    }
    collector.close();
    assert_eq!(fs::read(&dst_path).expect("reading dst"), payload);
}

#[test]
fn auto_file_input_adapts_and_round_trips() {
    let mut src = tempfile::NamedTempFile::new().expect("tempfile");
    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 13) as u8).collect();
    src.write_all(&payload).expect("writing payload");
    src.flush().expect("flushing");

    let mock = MockTransport::new();
    let inner = FileInput::from_path(src.path()).expect("opening input");
    let mut input = evio::element::AutoFileInput::with_samples(inner, 8);
    run_input(&mut input, &mock);
    assert_eq!(&mock.output()[..], &payload[..]);
}

// Property 6: a delimited collector consumes exactly its size regardless of
// chunking, and the residue stays in the source.
#[test]
fn delimited_collector_is_exact() {
    for chunk in [1usize, 3, 10, 100] {
        let mock = MockTransport::with_input(b"abcdefghijklmnopqrstuvwxyz");
        let mut collector = DelimitedCollector::new(StringCollector::new(), 5);
        until_done(|| collector.add_data(&mock, chunk).expect("collect"));
        assert_eq!(collector.inner().value(), b"abcde");
        assert_eq!(&mock.remaining_input()[..], b"fghijklmnopqrstuvwxyz");

        let after = collector.add_data(&mock, chunk).expect("collect when full");
        assert!(after.done);
        assert_eq!(after.bytes, 0);
    }
}

#[test]
fn collector_concatenation_is_associative() {
    fn delim(n: usize) -> Box<dyn Collector> {
        Box::new(DelimitedCollector::new(StringCollector::new(), n))
    }

    let feed = |mut collector: Box<dyn Collector>| {
        let mock = MockTransport::with_input(b"aaaaabbbbccc~~~");
        until_done(|| collector.add_data(&mock, 4).expect("collect"));
        mock.remaining_input()
    };

    let left = feed((delim(5) + delim(4)) + delim(3));
    let right = feed(delim(5) + (delim(4) + delim(3)));
    assert_eq!(&left[..], b"~~~");
    assert_eq!(left, right);
}

#[test]
fn collector_queue_splits_in_order() {
    let first = Rc::new(RefCell::new(Vec::new()));
    let second = Rc::new(RefCell::new(Vec::new()));

    let mut queue = CollectorQueue::new();
    for (size, slot) in [(5usize, Rc::clone(&first)), (4, Rc::clone(&second))] {
        queue.push(Box::new(
            DelimitedCollector::new(StringCollector::new(), size).on_close(move |collector| {
                slot.borrow_mut().extend_from_slice(collector.inner().value());
            }),
        ));
    }

    let mock = MockTransport::with_input(b"aaaaabbbb");
    until_done(|| queue.add_data(&mock, 3).expect("collect"));
    assert_eq!(first.borrow().as_slice(), b"aaaaa");
    assert_eq!(second.borrow().as_slice(), b"bbbb");
}

#[test]
fn keeping_queue_retains_finished_collectors() {
    let mut queue = KeepingCollectorQueue::new();
    for size in [5usize, 4, 3] {
        queue.push(Box::new(DelimitedCollector::new(
            StringCollector::new(),
            size,
        )));
    }

    let mock = MockTransport::with_input(b"aaaaabbbbccc");
    until_done(|| queue.add_data(&mock, 5).expect("collect"));

    let values: Vec<&[u8]> = queue
        .collected()
        .iter()
        .map(|collector| {
            collector
                .as_any()
                .downcast_ref::<DelimitedCollector<StringCollector>>()
                .expect("delimited string collector")
                .inner()
                .value()
        })
        .collect();
    assert_eq!(values, vec![&b"aaaaa"[..], &b"bbbb"[..], &b"ccc"[..]]);
}

#[test]
fn byte_array_collector_fills_exactly() {
    let mock = MockTransport::with_input(b"0123456789");
    let mut collector = ByteArrayCollector::new(4);
    until_done(|| collector.add_data(&mock, 64).expect("collect"));
    assert_eq!(collector.value(), b"0123");
    assert_eq!(&mock.remaining_input()[..], b"456789");
}

// Property 7: struct layouts round-trip.
#[test]
fn layout_round_trip() {
    let value: (u32, u8) = (5, 1);
    assert_eq!(decode::<(u32, u8)>(&encode(&value)), Some(value));

    let wide: (u16, i32, u8, u64) = (9, -12345, 250, u64::MAX / 3);
    assert_eq!(decode::<(u16, i32, u8, u64)>(&encode(&wide)), Some(wide));
}

// S2: "u32 length | u8 | string of length bytes" applied to
// pack("!LB", 5, 1) + "ABCDEFG" yields (5, 1, "ABCDE") and leaves "FG".
#[test]
fn length_prefixed_parse_leaves_residue() {
    let mut wire = encode(&(5u32, 1u8));
    wire.extend_from_slice(b"ABCDEFG");
    let mock = MockTransport::with_input(&wire);

    let header = Rc::new(Cell::new(None::<(u32, u8)>));
    let body = Rc::new(RefCell::new(Vec::new()));

    let mut stage = 0;
    let header_slot = Rc::clone(&header);
    let body_slot = Rc::clone(&body);
    let mut parser = FactoryCollector::new(move || {
        stage += 1;
        match stage {
            1 => {
                let header_slot = Rc::clone(&header_slot);
                Some(Box::new(
                    StructCollector::<(u32, u8)>::new().on_close(move |collector| {
                        header_slot.set(collector.value().copied());
                    }),
                ) as Box<dyn Collector>)
            }
            2 => {
                let length = header_slot.get().expect("header parsed first").0 as usize;
                let body_slot = Rc::clone(&body_slot);
                Some(Box::new(
                    DelimitedCollector::new(StringCollector::new(), length).on_close(
                        move |collector| {
                            body_slot
                                .borrow_mut()
                                .extend_from_slice(collector.inner().value());
                        },
                    ),
                ))
            }
            _ => None,
        }
    });

    until_done(|| parser.add_data(&mock, 3).expect("collect"));
    assert_eq!(header.get(), Some((5, 1)));
    assert_eq!(body.borrow().as_slice(), b"ABCDE");
    assert_eq!(&mock.remaining_input()[..], b"FG");
}

#[test]
fn struct_collector_decodes_on_close() {
    let mock = MockTransport::with_input(encode(&(258u16, 7u8)));
    let decoded = Rc::new(Cell::new(None));
    let slot = Rc::clone(&decoded);
    let mut collector = StructCollector::<(u16, u8)>::new()
        .on_close(move |collector| slot.set(collector.value().copied()));
    until_done(|| collector.add_data(&mock, 64).expect("collect"));
    assert_eq!(decoded.get(), Some((258, 7)));
}

#[test]
fn file_collector_respects_closing_flag() {
    let dst = tempfile::NamedTempFile::new().expect("tempfile");
    let mut keeper = FileCollector::new(dst.reopen().expect("reopen"), false, false);
    let mock = MockTransport::with_input(b"0123456789");
    keeper.add_data(&mock, 10).expect("collect");
    keeper.close();

    let mut file = keeper.into_file().expect("file retained");
    file.seek(SeekFrom::Start(0)).expect("seek");
    let mut contents = String::new();
    file.read_to_string(&mut contents).expect("read");
    assert_eq!(contents, "0123456789");
}
