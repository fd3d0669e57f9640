use std::fs;
use std::path::Path;

use glam::DVec3;
use insta::assert_snapshot;
use tempfile::tempdir;

use crate::error::CloudError;
use crate::io::PlyStreamWriter;
use crate::io::load_cell;
use crate::io::load_cloud;
use crate::io::load_npy;
use crate::io::load_ply;
use crate::io::load_xyz;
use crate::io::save_cell;
use crate::io::save_npy;
use crate::io::save_points;

fn npy_bytes(descr: &str, fortran: bool, rows: usize, cols: usize, payload: &[u8]) -> Vec<u8> {
    let order = if fortran { "True" } else { "False" };
    let mut dict =
        format!("{{'descr': '{descr}', 'fortran_order': {order}, 'shape': ({rows}, {cols}), }}");
    let unpadded = 6 + 2 + 2 + dict.len() + 1;
    dict.push_str(&" ".repeat((64 - unpadded % 64) % 64));
    dict.push('\n');

    let mut bytes = b"\x93NUMPY\x01\x00".to_vec();
    bytes.extend_from_slice(&u16::try_from(dict.len()).unwrap().to_le_bytes());
    bytes.extend_from_slice(dict.as_bytes());
    bytes.extend_from_slice(payload);
    bytes
}

#[test]
fn cell_file_format() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("cube_0_0_0_v1.txt");
    let points = [
        DVec3::new(0.0, 0.0, 0.0),
        DVec3::new(1.5, -2.25, 3.000_000_4),
        DVec3::new(0.123_456_4, 1000.0, 2.0 / 3.0),
    ];
    save_cell(&path, &points).unwrap();

    let text = fs::read_to_string(&path).unwrap();
    assert!(text.ends_with('\n'));
    assert!(!text.contains('\r'));
    assert_snapshot!(text, @r"
    0.000000 0.000000 0.000000
    1.500000 -2.250000 3.000000
    0.123456 1000.000000 0.666667
    ");

    let back = load_cell(&path).unwrap();
    assert_eq!(back.len(), 3);
    assert!((back[2] - points[2]).abs().max_element() < 1e-6);
}

#[test]
fn xyz_extra_columns_become_attributes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("scan.xyz");
    fs::write(
        &path,
        "# x y z intensity return\n\n1 2 3 0.5 1\n4 5 6 0.25 2\n",
    )
    .unwrap();

    let cloud = load_xyz(&path).unwrap();
    assert_eq!(cloud.points(), &[DVec3::new(1.0, 2.0, 3.0), DVec3::new(4.0, 5.0, 6.0)]);
    assert_eq!(cloud.attribute("column_3"), Some(&[0.5, 0.25][..]));
    assert_eq!(cloud.attribute("column_4"), Some(&[1.0, 2.0][..]));
}

#[test]
fn xyz_errors_carry_the_line() {
    let dir = tempdir().unwrap();

    let short = dir.path().join("short.xyz");
    fs::write(&short, "1 2 3\n1 2\n").unwrap();
    assert!(matches!(
        load_xyz(&short),
        Err(CloudError::Parse { line: 2, .. })
    ));

    let ragged = dir.path().join("ragged.xyz");
    fs::write(&ragged, "1 2 3 4\n1 2 3\n").unwrap();
    assert!(matches!(
        load_xyz(&ragged),
        Err(CloudError::Parse { line: 2, .. })
    ));

    let nan = dir.path().join("nan.xyz");
    fs::write(&nan, "1 2 3\n\n1 NaN 3\n").unwrap();
    assert!(matches!(
        load_xyz(&nan),
        Err(CloudError::Parse { line: 3, .. })
    ));

    let missing = dir.path().join("missing.xyz");
    assert!(matches!(load_xyz(&missing), Err(CloudError::Io { .. })));
}

#[test]
fn ascii_ply_with_faces() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("tri.ply");
    fs::write(
        &path,
        "ply\n\
         format ascii 1.0\n\
         comment made by hand\n\
         element vertex 3\n\
         property float x\n\
         property float y\n\
         property float z\n\
         property uchar red\n\
         element face 1\n\
         property list uchar int vertex_indices\n\
         end_header\n\
         0 0 0 255\n\
         1 0 0 128\n\
         0 1 0.5 0\n\
         3 0 1 2\n",
    )
    .unwrap();

    let cloud = load_cloud(&path).unwrap();
    assert_eq!(cloud.len(), 3);
    assert_eq!(cloud.points()[2], DVec3::new(0.0, 1.0, 0.5));
    assert_eq!(cloud.attribute("red"), Some(&[255.0, 128.0, 0.0][..]));
}

#[test]
fn big_endian_ply() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("be.ply");
    let mut bytes = b"ply\nformat binary_big_endian 1.0\nelement vertex 2\n\
        property float x\nproperty float y\nproperty float z\nproperty int label\nend_header\n"
        .to_vec();
    for (p, label) in [([1.0_f32, 2.0, 3.0], 7_i32), ([-1.5, 0.25, 8.0], -2)] {
        for v in p {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        bytes.extend_from_slice(&label.to_be_bytes());
    }
    fs::write(&path, bytes).unwrap();

    let cloud = load_ply(&path).unwrap();
    assert_eq!(
        cloud.points(),
        &[DVec3::new(1.0, 2.0, 3.0), DVec3::new(-1.5, 0.25, 8.0)]
    );
    assert_eq!(cloud.attribute("label"), Some(&[7.0, -2.0][..]));
}

#[test]
fn truncated_binary_ply() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("short.ply");
    let mut bytes = b"ply\nformat binary_little_endian 1.0\nelement vertex 2\n\
        property double x\nproperty double y\nproperty double z\nend_header\n"
        .to_vec();
    bytes.extend_from_slice(&[0_u8; 30]);
    fs::write(&path, bytes).unwrap();
    assert!(matches!(
        load_ply(&path),
        Err(CloudError::Parse { line: 2, .. })
    ));
}

#[test]
fn ply_without_z() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("flat.ply");
    fs::write(
        &path,
        "ply\nformat ascii 1.0\nelement vertex 1\nproperty float x\nproperty float y\nend_header\n1 2\n",
    )
    .unwrap();
    assert!(matches!(
        load_ply(&path),
        Err(CloudError::UnsupportedPly { .. })
    ));
}

#[test]
fn written_ply_reads_back() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("out").join("cloud_completed.ply");
    let points = vec![DVec3::new(0.1, 0.2, 0.3), DVec3::new(-4.0, 5.5, 1e-9)];
    save_points(&path, &points).unwrap();
    assert_eq!(load_ply(&path).unwrap().into_points(), points);
}

#[test]
fn streamed_ply_matches_buffered() {
    let dir = tempdir().unwrap();
    let points: Vec<DVec3> = (0..25)
        .map(|i| DVec3::new(f64::from(i), f64::from(i) * 0.5, -f64::from(i)))
        .collect();

    let buffered = dir.path().join("buffered.ply");
    save_points(&buffered, &points).unwrap();

    let streamed = dir.path().join("streamed.ply");
    let mut writer = PlyStreamWriter::create(&streamed).unwrap();
    for chunk in points.chunks(7) {
        writer.push(chunk).unwrap();
    }
    assert_eq!(writer.count(), 25);
    assert_eq!(writer.finish().unwrap(), 25);

    assert_eq!(fs::read(&buffered).unwrap(), fs::read(&streamed).unwrap());
}

#[test]
fn npy_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fine.npy");
    let points = vec![DVec3::new(1.0, 2.0, 3.0), DVec3::new(-0.5, 0.0, 7.25)];
    save_npy(&path, &points).unwrap();

    let bytes = fs::read(&path).unwrap();
    let header_len = usize::from(u16::from_le_bytes([bytes[8], bytes[9]]));
    assert_eq!((10 + header_len) % 64, 0);
    assert_eq!(load_npy(&path).unwrap(), points);
}

#[test]
fn npy_float32_with_extra_columns() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("fine.npy");
    let values: [f32; 8] = [1.0, 2.0, 3.0, 9.0, 4.0, 5.0, 6.0, 9.0];
    let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    fs::write(&path, npy_bytes("<f4", false, 2, 4, &payload)).unwrap();

    assert_eq!(
        load_npy(&path).unwrap(),
        vec![DVec3::new(1.0, 2.0, 3.0), DVec3::new(4.0, 5.0, 6.0)]
    );
}

#[test]
fn npy_rejections() {
    let dir = tempdir().unwrap();
    let write = |name: &str, bytes: Vec<u8>| {
        let path = dir.path().join(name);
        fs::write(&path, bytes).unwrap();
        path
    };
    let reject = |path: &Path| matches!(load_npy(path), Err(CloudError::Npy { .. }));

    let payload = vec![0_u8; 2 * 3 * 8];
    assert!(reject(&write("fortran.npy", npy_bytes("<f8", true, 2, 3, &payload))));
    assert!(reject(&write("ints.npy", npy_bytes("<i8", false, 2, 3, &payload))));
    assert!(reject(&write("narrow.npy", npy_bytes("<f8", false, 3, 2, &payload))));
    assert!(reject(&write("short.npy", npy_bytes("<f8", false, 3, 3, &payload))));
    assert!(reject(&write("junk.npy", b"not numpy at all".to_vec())));
}

#[test]
fn unknown_extension() {
    assert!(matches!(
        load_cloud(Path::new("cloud.las")),
        Err(CloudError::UnknownFormat { .. })
    ));
}
